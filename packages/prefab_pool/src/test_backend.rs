//! An in-memory backend for unit tests. Counts instantiations and releases and can be told to
//! fail or to suspend until cancelled or resumed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Backend, Error, InstanceId, Liveness, Poolable, Result};

#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    next_id: AtomicU64,
    instantiated: AtomicUsize,
    released: AtomicUsize,
    suspend: AtomicBool,
    fail: AtomicBool,
    resume: CancellationToken,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn instantiated(&self) -> usize {
        self.instantiated.load(Ordering::Relaxed)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Instantiation waits for cancellation or [`resume()`][Self::resume] instead of completing.
    pub(crate) fn set_suspend(&self, suspend: bool) {
        self.suspend.store(suspend, Ordering::Relaxed);
    }

    /// Lets every suspended instantiation complete, now and from here on.
    pub(crate) fn resume(&self) {
        self.resume.cancel();
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl Backend for FakeBackend {
    type Source = &'static str;
    type Placement = u32;
    type Instance = Handle;

    async fn instantiate(
        &self,
        source: &&'static str,
        placement: Option<&u32>,
        cancel: &CancellationToken,
    ) -> Result<Handle> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::backend("fake backend failure"));
        }

        if self.suspend.load(Ordering::Relaxed) {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = self.resume.cancelled() => {}
            }
        }

        self.instantiated.fetch_add(1, Ordering::Relaxed);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Handle::new(id, *source, placement.copied()))
    }

    fn release(&self, instance: Handle) {
        self.released.fetch_add(1, Ordering::Relaxed);
        instance.destroy();
    }

    fn on_instantiated(&self, instance: &mut Handle, placement: Option<&u32>) {
        if let Some(placement) = placement {
            *instance.entity.placement.lock() = Some(*placement);
        }
    }

    fn on_return(&self, instance: &mut Handle, placement: Option<&u32>) {
        instance.entity.active.store(false, Ordering::Relaxed);
        *instance.entity.placement.lock() = placement.copied();
    }
}

/// A fake spawned entity. Clones refer to the same entity.
#[derive(Clone, Debug)]
pub(crate) struct Handle {
    pub(crate) source: &'static str,
    entity: Arc<Entity>,
}

#[derive(Debug)]
struct Entity {
    id: u64,
    placement: Mutex<Option<u32>>,
    active: AtomicBool,
    destroyed: AtomicBool,
}

impl Handle {
    fn new(id: u64, source: &'static str, placement: Option<u32>) -> Self {
        Self {
            source,
            entity: Arc::new(Entity {
                id,
                placement: Mutex::new(placement),
                active: AtomicBool::new(true),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn placement(&self) -> Option<u32> {
        *self.entity.placement.lock()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.entity.active.load(Ordering::Relaxed)
    }

    /// Destroys the entity the way its environment would, outside of any pool.
    pub(crate) fn destroy(&self) {
        self.entity.destroyed.store(true, Ordering::Relaxed);
    }
}

impl Poolable for Handle {
    fn instance_id(&self) -> InstanceId {
        InstanceId::new(self.entity.id)
    }

    fn is_destroyed(&self) -> bool {
        self.entity.destroyed.load(Ordering::Relaxed)
    }

    fn liveness(&self) -> Option<Liveness> {
        Some(Liveness::of(&self.entity))
    }
}
