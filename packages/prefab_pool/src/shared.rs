use std::any::Any;
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use derive_more::Display;
use foldhash::fast::RandomState;
use parking_lot::RwLock;
use tracing::debug;

use crate::{Error, Result};

static GLOBAL: OnceLock<Arc<SharedPools>> = OnceLock::new();

/// Name under which a pool is shared.
#[derive(Clone, Debug, Display, Eq, Hash, PartialEq)]
pub struct PoolToken(Cow<'static, str>);

impl PoolToken {
    /// Creates a token from a name known at compile time.
    #[must_use]
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// The name of the token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for PoolToken {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for PoolToken {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl Borrow<str> for PoolToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A registry of pools shared between unrelated parts of a program, keyed by name.
///
/// Any `Send + Sync` pool type can be registered. Lookups name the expected type and fail
/// softly when the registered pool has a different one.
///
/// # Example
///
/// ```
/// use prefab_pool::SharedPools;
///
/// let pools = SharedPools::new();
/// pools.register("scratch", Vec::<u8>::new())?;
///
/// assert!(pools.get::<Vec<u8>>("scratch").is_some());
/// assert!(pools.get::<String>("scratch").is_none());
/// # Ok::<(), prefab_pool::Error>(())
/// ```
#[derive(Default)]
pub struct SharedPools {
    pools: RwLock<HashMap<PoolToken, Arc<dyn Any + Send + Sync>, RandomState>>,
}

impl SharedPools {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the process-wide registry.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if a process-wide registry is already installed.
    pub fn install_global(registry: Arc<Self>) -> Result<()> {
        GLOBAL
            .set(registry)
            .map_err(|_rejected| Error::InvalidArgument { name: "registry" })
    }

    /// The process-wide registry, if one has been installed.
    #[must_use]
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Shares `pool` under `token`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the token is empty and [`Error::DuplicateToken`] if a pool
    /// is already registered under it.
    pub fn register<P>(&self, token: impl Into<PoolToken>, pool: P) -> Result<Arc<P>>
    where
        P: Any + Send + Sync,
    {
        let token = token.into();

        if token.as_str().is_empty() {
            return Err(Error::InvalidArgument { name: "token" });
        }

        let mut pools = self.pools.write();

        if pools.contains_key(&token) {
            return Err(Error::DuplicateToken {
                token: token.as_str().to_owned(),
            });
        }

        let pool = Arc::new(pool);
        let erased: Arc<dyn Any + Send + Sync> = Arc::<P>::clone(&pool);

        debug!(%token, "registered shared pool");
        pools.insert(token, erased);

        Ok(pool)
    }

    /// The pool registered under `token`, if there is one of type `P`.
    #[must_use]
    pub fn get<P>(&self, token: &str) -> Option<Arc<P>>
    where
        P: Any + Send + Sync,
    {
        let pool = self.pools.read().get(token).map(Arc::clone)?;
        pool.downcast::<P>().ok()
    }

    /// The pool registered under `token`, registering the one made by `create` if there is
    /// none yet.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the token is empty and [`Error::DuplicateToken`] if the
    /// token is taken by a pool of a different type.
    pub fn get_or_insert_with<P>(
        &self,
        token: impl Into<PoolToken>,
        create: impl FnOnce() -> P,
    ) -> Result<Arc<P>>
    where
        P: Any + Send + Sync,
    {
        let token = token.into();

        if token.as_str().is_empty() {
            return Err(Error::InvalidArgument { name: "token" });
        }

        let mut pools = self.pools.write();

        if let Some(existing) = pools.get(&token) {
            return Arc::clone(existing)
                .downcast::<P>()
                .map_err(|_other_type| Error::DuplicateToken {
                    token: token.as_str().to_owned(),
                });
        }

        let pool = Arc::new(create());
        let erased: Arc<dyn Any + Send + Sync> = Arc::<P>::clone(&pool);

        debug!(%token, "registered shared pool");
        pools.insert(token, erased);

        Ok(pool)
    }

    /// Stops sharing the pool registered under `token`. Returns whether there was one.
    ///
    /// Holders of the pool keep it alive; the registry just forgets it.
    pub fn remove(&self, token: &str) -> bool {
        self.pools.write().remove(token).is_some()
    }

    /// Number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// Whether no pools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

impl fmt::Debug for SharedPools {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.pools.read();
        let mut tokens = pools.keys().map(PoolToken::as_str).collect::<Vec<_>>();
        tokens.sort_unstable();

        f.debug_struct("SharedPools")
            .field("tokens", &tokens)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SharedPools: Send, Sync);
    assert_impl_all!(PoolToken: Send, Sync, Clone);

    #[test]
    fn register_and_get() {
        let pools = SharedPools::new();

        let registered = pools.register("enemies", 5_u32).unwrap();
        let found = pools.get::<u32>("enemies").unwrap();

        assert!(Arc::ptr_eq(&registered, &found));
        assert_eq!(pools.len(), 1);
    }

    #[test]
    fn duplicate_token_is_rejected() {
        let pools = SharedPools::new();
        pools.register("enemies", 5_u32).unwrap();

        let result = pools.register(String::from("enemies"), 6_u32);

        assert!(matches!(result, Err(Error::DuplicateToken { token }) if token == "enemies"));
        assert_eq!(*pools.get::<u32>("enemies").unwrap(), 5);
    }

    #[test]
    fn empty_token_is_rejected() {
        let pools = SharedPools::new();

        let result = pools.register("", 5_u32);

        assert!(matches!(result, Err(Error::InvalidArgument { name: "token" })));
        assert!(pools.is_empty());
    }

    #[test]
    fn get_with_wrong_type_is_none() {
        let pools = SharedPools::new();
        pools.register("enemies", 5_u32).unwrap();

        assert!(pools.get::<String>("enemies").is_none());
        assert!(pools.get::<u32>("allies").is_none());
    }

    #[test]
    fn get_or_insert_with_creates_once() {
        let pools = SharedPools::new();

        let first = pools.get_or_insert_with("names", || vec!["a"]).unwrap();
        let second = pools
            .get_or_insert_with("names", || -> Vec<&str> { panic!("must not create twice") })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));

        let mismatched = pools.get_or_insert_with("names", || 1_u8);
        assert!(matches!(mismatched, Err(Error::DuplicateToken { .. })));
    }

    #[test]
    fn remove_forgets_pool() {
        let pools = SharedPools::new();
        let pool = pools.register(PoolToken::from_static("enemies"), 5_u32).unwrap();

        assert!(pools.remove("enemies"));
        assert!(!pools.remove("enemies"));
        assert!(pools.get::<u32>("enemies").is_none());
        assert_eq!(*pool, 5);
    }
}
