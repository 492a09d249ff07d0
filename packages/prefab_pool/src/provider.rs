use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::metrics::{CREATED, INSTANTIATE_MS};
use crate::{Error, Poolable, Result};

/// Creates and destroys the instances of a single kind of resource.
///
/// A pool owns exactly one provider. The pool decides when to create and when to destroy, the
/// provider decides how.
///
/// Instantiation may suspend (e.g. while an asset loads) and must observe the cancellation
/// token. When cancelled it fails with [`Error::Cancelled`] and must not leave a half-created
/// instance behind.
pub trait Provider: Send + Sync + 'static {
    /// The type of the instances produced.
    type Instance: Poolable;

    /// Where newly created or returned instances are placed (e.g. a parent node in a scene).
    type Placement: Clone + Debug + Send + Sync + 'static;

    /// Creates a new instance.
    ///
    /// # Errors
    ///
    /// [`Error::SourceMissing`] if the provider has no template, [`Error::Cancelled`] if the
    /// token was cancelled, or any error raised by the underlying instantiation mechanism.
    fn instantiate(
        &self,
        placement: Option<&Self::Placement>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Instance>> + Send;

    /// Permanently destroys an instance.
    ///
    /// Must tolerate instances that were already destroyed by their environment.
    fn release(&self, instance: Self::Instance);

    /// The placement configured on the provider, if any.
    fn placement(&self) -> Option<&Self::Placement>;

    /// How many instances to create ahead of demand when the pool is prepooled.
    fn prepool_count(&self) -> usize;

    /// Called once for every newly created instance, before it is handed out or pooled.
    fn on_instantiated(&self, _instance: &mut Self::Instance, _placement: Option<&Self::Placement>) {
    }

    /// Called every time an instance comes back to the pool, before it is queued.
    ///
    /// This is where an instance is deactivated or moved back under its placement.
    fn on_return(&self, _instance: &mut Self::Instance, _placement: Option<&Self::Placement>) {}
}

/// The mechanism that turns a template into live instances, e.g. an asset loader.
///
/// A backend is shared by every [`Kind`] built on top of it. Each kind supplies the template
/// (`Source`) to instantiate from.
pub trait Backend: Send + Sync + 'static {
    /// Identifies a template. Two kinds with equal sources share one pool.
    type Source: Clone + Debug + Eq + Hash + Send + Sync + 'static;

    /// Where instances are placed.
    type Placement: Clone + Debug + Send + Sync + 'static;

    /// The type of the instances produced.
    type Instance: Poolable;

    /// Creates an instance of `source`.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if the token was cancelled, or any error raised while loading or
    /// constructing the instance.
    fn instantiate(
        &self,
        source: &Self::Source,
        placement: Option<&Self::Placement>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Instance>> + Send;

    /// Permanently destroys an instance. Must tolerate already-destroyed instances.
    fn release(&self, instance: Self::Instance);

    /// See [`Provider::on_instantiated`].
    fn on_instantiated(&self, _instance: &mut Self::Instance, _placement: Option<&Self::Placement>) {
    }

    /// See [`Provider::on_return`].
    fn on_return(&self, _instance: &mut Self::Instance, _placement: Option<&Self::Placement>) {}
}

/// Identity of "what can be instantiated": a template plus how to place and prepool it.
///
/// Two kinds are equal when their sources are equal. Placement and prepool count do not take
/// part in equality or hashing, so requests for the same template with different placement
/// hints still share a single pool of instances.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use prefab_pool::{Backend, Kind, Result};
/// # use tokio_util::sync::CancellationToken;
/// # struct Loader;
/// # impl Backend for Loader {
/// #     type Source = &'static str;
/// #     type Placement = u32;
/// #     type Instance = Arc<String>;
/// #     async fn instantiate(&self, source: &&'static str, _: Option<&u32>, _: &CancellationToken) -> Result<Arc<String>> {
/// #         Ok(Arc::new(source.to_string()))
/// #     }
/// #     fn release(&self, _: Arc<String>) {}
/// # }
/// let loader = Arc::new(Loader);
///
/// let near = Kind::builder(Arc::clone(&loader)).source("bullet").placement(1).build();
/// let far = Kind::builder(loader).source("bullet").placement(2).prepool_count(10).build();
///
/// assert_eq!(near, far);
/// ```
pub struct Kind<B: Backend> {
    source: Option<B::Source>,
    placement: Option<B::Placement>,
    prepool_count: usize,
    backend: Arc<B>,
}

impl<B: Backend> Kind<B> {
    /// Starts building a kind on top of a backend.
    pub fn builder(backend: Arc<B>) -> KindBuilder<B> {
        KindBuilder::new(backend)
    }

    /// The template instances are created from.
    #[must_use]
    pub fn source(&self) -> Option<&B::Source> {
        self.source.as_ref()
    }

    /// The backend that instantiates this kind.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<B: Backend> Provider for Kind<B> {
    type Instance = B::Instance;
    type Placement = B::Placement;

    fn instantiate(
        &self,
        placement: Option<&B::Placement>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<B::Instance>> + Send {
        async move {
            let source = self.source.as_ref().ok_or(Error::SourceMissing)?;
            self.backend.instantiate(source, placement, cancel).await
        }
    }

    fn release(&self, instance: B::Instance) {
        self.backend.release(instance);
    }

    fn placement(&self) -> Option<&B::Placement> {
        self.placement.as_ref()
    }

    fn prepool_count(&self) -> usize {
        self.prepool_count
    }

    fn on_instantiated(&self, instance: &mut B::Instance, placement: Option<&B::Placement>) {
        self.backend.on_instantiated(instance, placement);
    }

    fn on_return(&self, instance: &mut B::Instance, placement: Option<&B::Placement>) {
        self.backend.on_return(instance, placement);
    }
}

impl<B: Backend> Clone for Kind<B> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            placement: self.placement.clone(),
            prepool_count: self.prepool_count,
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> PartialEq for Kind<B> {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl<B: Backend> Eq for Kind<B> {}

impl<B: Backend> Hash for Kind<B> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl<B: Backend> Debug for Kind<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kind")
            .field("source", &self.source)
            .field("placement", &self.placement)
            .field("prepool_count", &self.prepool_count)
            .finish_non_exhaustive()
    }
}

/// Builder for creating an instance of [`Kind`].
///
/// Every setting is optional. A kind without a source can be built but fails with
/// [`Error::SourceMissing`] when asked to instantiate.
#[must_use]
pub struct KindBuilder<B: Backend> {
    source: Option<B::Source>,
    placement: Option<B::Placement>,
    prepool_count: usize,
    backend: Arc<B>,
}

impl<B: Backend> KindBuilder<B> {
    fn new(backend: Arc<B>) -> Self {
        Self {
            source: None,
            placement: None,
            prepool_count: 0,
            backend,
        }
    }

    /// Sets the template to instantiate from.
    pub fn source(mut self, source: B::Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets where instances are placed when created or returned.
    pub fn placement(mut self, placement: B::Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Sets how many instances to create ahead of demand.
    pub fn prepool_count(mut self, count: usize) -> Self {
        self.prepool_count = count;
        self
    }

    /// Builds the kind.
    #[must_use]
    pub fn build(self) -> Kind<B> {
        Kind {
            source: self.source,
            placement: self.placement,
            prepool_count: self.prepool_count,
            backend: self.backend,
        }
    }
}

impl<B: Backend> Debug for KindBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindBuilder")
            .field("source", &self.source)
            .field("placement", &self.placement)
            .field("prepool_count", &self.prepool_count)
            .finish_non_exhaustive()
    }
}

/// Creates one instance through `provider` and runs its post-creation hook.
///
/// Cancellation wins over a completed instantiation that has not been observed yet. The
/// instantiation future is dropped on cancellation, which is what releases anything it held.
pub(crate) async fn create<P: Provider>(
    provider: &P,
    placement: Option<&P::Placement>,
    cancel: &CancellationToken,
) -> Result<P::Instance> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let started = Instant::now();

    let mut instance = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        result = provider.instantiate(placement, cancel) => result?,
    };

    INSTANTIATE_MS.with(|e| e.observe_millis(started.elapsed()));
    CREATED.with(|e| e.observe_once());

    provider.on_instantiated(&mut instance, placement);

    Ok(instance)
}
