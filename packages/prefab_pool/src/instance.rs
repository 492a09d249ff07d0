use std::any::Any;
use std::sync::{Arc, Weak};

use derive_more::Display;

/// Stable identity of a pooled instance.
///
/// Pools key their queues and reverse indexes by this value, so it must stay the same for as
/// long as the instance exists and must not be shared by two live instances.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("#{_0}")]
pub struct InstanceId(u64);

impl InstanceId {
    /// Creates an identity from a raw numeric key.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw numeric key.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for InstanceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// An object that can be stored in and rented from a pool.
///
/// The pool never inspects the content of an instance. It only needs its identity, and
/// optionally whether it has already been destroyed by its environment and a way to observe
/// its lifetime without keeping it alive.
///
/// `Arc<T>` implements this trait, using the address of the shared allocation as the identity.
pub trait Poolable: Send + 'static {
    /// Stable identity of the instance.
    fn instance_id(&self) -> InstanceId;

    /// Whether the environment has already destroyed the instance.
    ///
    /// Destroyed instances are silently dropped when returned and skipped when rented.
    fn is_destroyed(&self) -> bool {
        false
    }

    /// A weak observer of the instance, used by the statistics tracker.
    ///
    /// Instances that return `None` are still pooled normally but are not counted as alive.
    fn liveness(&self) -> Option<Liveness> {
        None
    }
}

impl<T> Poolable for Arc<T>
where
    T: Send + Sync + 'static,
{
    fn instance_id(&self) -> InstanceId {
        // usize to u64 is lossless on every supported target.
        InstanceId(Arc::as_ptr(self).cast::<()>().addr() as u64)
    }

    fn liveness(&self) -> Option<Liveness> {
        Some(Liveness::of(self))
    }
}

/// Observes whether an instance is still alive without keeping it alive.
#[derive(Clone, Debug)]
pub struct Liveness {
    target: Weak<dyn Any + Send + Sync>,
}

impl Liveness {
    /// Creates an observer for a shared allocation.
    #[must_use]
    pub fn of<T>(target: &Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        let target: Weak<T> = Arc::downgrade(target);
        Self { target }
    }

    /// Creates an observer from an existing weak reference.
    #[must_use]
    pub fn from_weak<T>(target: Weak<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self { target }
    }

    /// Whether at least one strong reference to the observed instance still exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}
