use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::kind_pool::PoolSignal;
use crate::{
    Backend, DestroyNotifier, Error, InstanceId, Kind, KindPool, Poolable, Result, Returnable,
    Tracker,
};

type SubPool<B> = Arc<KindPool<Kind<B>>>;

/// Routes many kinds of resources through one pool per kind.
///
/// Sub-pools are created lazily on first use of a kind. The pool remembers which kind every
/// rented instance came from, so instances can be returned without naming their kind.
///
/// Templates can also be rented directly by source with [`rent_source()`]; equal sources
/// resolve to one canonical kind and therefore to one sub-pool.
///
/// [`rent_source()`]: GlobalPool::rent_source
pub struct GlobalPool<B: Backend> {
    backend: Arc<B>,
    index: Arc<Mutex<Index<B>>>,
    alias_placement: Option<B::Placement>,
    alias_prepool_count: usize,
    tracker: Option<Arc<Tracker>>,
}

struct Index<B: Backend> {
    sub_pools: HashMap<Kind<B>, SubPool<B>, RandomState>,

    // Every rented instance maps to the kind it was rented as. Entries are removed when the
    // instance comes back or is destroyed.
    owner_of: HashMap<InstanceId, Kind<B>, RandomState>,

    // Canonical kind per source for rents that name only a source.
    aliases: HashMap<B::Source, Kind<B>, RandomState>,

    // Rents still waiting on their sub-pool, per kind.
    pending: HashMap<Kind<B>, Pending, RandomState>,
}

#[derive(Debug, Default)]
struct Pending {
    renting: usize,

    // The sub-pool was created by one of these rents and none of them has succeeded yet.
    fresh: bool,
}

impl<B: Backend> Default for Index<B> {
    fn default() -> Self {
        Self {
            sub_pools: HashMap::default(),
            owner_of: HashMap::default(),
            aliases: HashMap::default(),
            pending: HashMap::default(),
        }
    }
}

impl<B: Backend> GlobalPool<B> {
    /// Creates an empty global pool on top of `backend`.
    pub fn new(backend: Arc<B>) -> Self {
        Self::builder(backend).build()
    }

    /// Starts building a global pool on top of `backend`.
    pub fn builder(backend: Arc<B>) -> GlobalPoolBuilder<B> {
        GlobalPoolBuilder::new(backend)
    }

    /// Rents an instance of `kind`, creating its sub-pool on first use.
    ///
    /// # Errors
    ///
    /// [`Error::SourceMissing`] if the kind has no source, or whatever the backend fails with.
    pub async fn rent(&self, kind: &Kind<B>) -> Result<B::Instance> {
        self.rent_with(kind, &CancellationToken::new()).await
    }

    /// Rents an instance of `kind`, giving up if `cancel` is cancelled first.
    ///
    /// A sub-pool created by a rent that then fails is discarded again once no other rent is
    /// waiting on it, so a cancelled rent leaves no trace.
    ///
    /// # Errors
    ///
    /// [`Error::SourceMissing`] if the kind has no source, [`Error::Cancelled`] on
    /// cancellation, or whatever the backend fails with.
    pub async fn rent_with(
        &self,
        kind: &Kind<B>,
        cancel: &CancellationToken,
    ) -> Result<B::Instance> {
        if kind.source().is_none() {
            return Err(Error::SourceMissing);
        }

        let mut rent = self.begin_rent(kind);
        let instance = rent.pool.rent_with(cancel).await?;

        let id = instance.instance_id();
        self.index.lock().owner_of.insert(id, kind.clone());
        rent.succeeded = true;

        trace!(%id, source = ?kind.source(), "rented from global pool");
        Ok(instance)
    }

    /// Rents an instance of the template `source`, through its canonical kind.
    ///
    /// The canonical kind uses the placement and prepool count configured on the builder.
    ///
    /// # Errors
    ///
    /// Whatever the backend fails with.
    pub async fn rent_source(&self, source: B::Source) -> Result<B::Instance> {
        self.rent_source_with(source, &CancellationToken::new())
            .await
    }

    /// Cancellable form of [`rent_source()`](GlobalPool::rent_source).
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] on cancellation, or whatever the backend fails with.
    pub async fn rent_source_with(
        &self,
        source: B::Source,
        cancel: &CancellationToken,
    ) -> Result<B::Instance> {
        let kind = self.alias_kind(source);
        self.rent_with(&kind, cancel).await
    }

    /// Hands an instance back to the sub-pool it was rented from.
    ///
    /// # Errors
    ///
    /// [`Error::UnregisteredInstance`] if the instance was not rented from this pool or was
    /// already returned. The instance is dropped in that case.
    pub fn return_instance(&self, instance: B::Instance) -> Result<()> {
        let id = instance.instance_id();

        let pool = {
            let mut index = self.index.lock();
            let pool = index
                .owner_of
                .get(&id)
                .and_then(|kind| index.sub_pools.get(kind))
                .map(Arc::clone);

            if pool.is_none() {
                index.owner_of.remove(&id);
            }

            pool
        };

        let Some(pool) = pool else {
            if instance.is_destroyed() {
                trace!(%id, "dropping destroyed instance with no owner");
                return Ok(());
            }

            error!(%id, "returned instance is not registered with the global pool");
            return Err(Error::UnregisteredInstance { id });
        };

        pool.return_instance(instance);
        Ok(())
    }

    /// Hands an instance back to the sub-pool of `kind`.
    ///
    /// # Errors
    ///
    /// [`Error::UnregisteredInstance`] if there is no sub-pool for `kind`. The instance is
    /// dropped in that case.
    pub fn return_to(&self, kind: &Kind<B>, instance: B::Instance) -> Result<()> {
        let pool = self.index.lock().sub_pools.get(kind).map(Arc::clone);

        let Some(pool) = pool else {
            let id = instance.instance_id();
            error!(%id, source = ?kind.source(), "no sub-pool for the kind of the returned instance");
            return Err(Error::UnregisteredInstance { id });
        };

        pool.return_instance(instance);
        Ok(())
    }

    /// Releases queued instances of every sub-pool through the backend until at most `keep`
    /// remain in each. Returns how many were released in total.
    pub fn release_all_excess(&self, keep: usize) -> usize {
        self.sub_pools()
            .iter()
            .map(|pool| pool.release_excess(keep))
            .sum()
    }

    /// Like [`release_all_excess()`](GlobalPool::release_all_excess), but passes the removed
    /// instances to `on_released` instead of releasing them.
    pub fn release_all_excess_with(
        &self,
        keep: usize,
        mut on_released: impl FnMut(B::Instance),
    ) -> usize {
        self.sub_pools()
            .iter()
            .map(|pool| pool.release_excess_with(keep, &mut on_released))
            .sum()
    }

    /// Creates the sub-pool of `kind` if needed and prepools it.
    ///
    /// # Errors
    ///
    /// [`Error::SourceMissing`] if the kind has no source, [`Error::Cancelled`] on
    /// cancellation, or whatever the backend fails with.
    pub async fn prepool(
        &self,
        kind: &Kind<B>,
        default_placement: Option<B::Placement>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if kind.source().is_none() {
            return Err(Error::SourceMissing);
        }

        let (pool, _) = self.sub_pool_in(&mut self.index.lock(), kind);
        pool.prepool(default_placement, cancel).await
    }

    /// Releases every queued instance of every sub-pool and drops the pool.
    pub fn dispose(self) {
        let sub_pools = {
            let mut index = self.index.lock();
            index.owner_of.clear();
            index.aliases.clear();
            index.pending.clear();
            index.sub_pools.drain().map(|(_, pool)| pool).collect::<Vec<_>>()
        };

        let count = sub_pools.len();
        let released: usize = sub_pools.iter().map(|pool| pool.drain_and_release()).sum();

        debug!(sub_pools = count, released, "disposed global pool");
    }

    /// Number of kinds with a sub-pool.
    #[must_use]
    pub fn sub_pool_count(&self) -> usize {
        self.index.lock().sub_pools.len()
    }

    /// Whether the instance `id` is rented out from this pool.
    #[must_use]
    pub fn is_registered(&self, id: InstanceId) -> bool {
        self.index.lock().owner_of.contains_key(&id)
    }

    /// Number of queued instances of `kind`.
    #[must_use]
    pub fn len_of(&self, kind: &Kind<B>) -> usize {
        let pool = self.index.lock().sub_pools.get(kind).map(Arc::clone);
        pool.map_or(0, |pool| pool.len())
    }

    /// The destroy notifier of the sub-pool of `kind`, if that sub-pool exists.
    #[must_use]
    pub fn destroy_notifier_for(&self, kind: &Kind<B>) -> Option<DestroyNotifier> {
        self.index
            .lock()
            .sub_pools
            .get(kind)
            .map(|pool| pool.destroy_notifier())
    }

    fn begin_rent<'a>(&'a self, kind: &'a Kind<B>) -> PendingRent<'a, B> {
        let mut index = self.index.lock();
        let (pool, created) = self.sub_pool_in(&mut index, kind);

        let pending = index.pending.entry(kind.clone()).or_default();
        pending.renting = pending.renting.saturating_add(1);
        pending.fresh |= created;

        PendingRent {
            global: self,
            kind,
            pool,
            succeeded: false,
        }
    }

    fn sub_pool_in(&self, index: &mut Index<B>, kind: &Kind<B>) -> (SubPool<B>, bool) {
        if let Some(pool) = index.sub_pools.get(kind) {
            return (Arc::clone(pool), false);
        }

        let pool = Arc::new(self.new_sub_pool(kind.clone()));
        index.sub_pools.insert(kind.clone(), Arc::clone(&pool));

        debug!(source = ?kind.source(), "created sub-pool");
        (pool, true)
    }

    fn new_sub_pool(&self, kind: Kind<B>) -> KindPool<Kind<B>> {
        let source = kind.source().cloned();

        let pool = KindPool::with_tracker(kind, self.tracker.clone());

        let index = Arc::downgrade(&self.index);
        pool.subscribe(move |signal| on_sub_pool_signal(&index, source.as_ref(), signal));

        pool
    }

    fn alias_kind(&self, source: B::Source) -> Kind<B> {
        let mut index = self.index.lock();

        index
            .aliases
            .entry(source.clone())
            .or_insert_with(|| {
                let mut builder = Kind::builder(Arc::clone(&self.backend))
                    .source(source)
                    .prepool_count(self.alias_prepool_count);

                if let Some(placement) = &self.alias_placement {
                    builder = builder.placement(placement.clone());
                }

                builder.build()
            })
            .clone()
    }

    fn sub_pools(&self) -> Vec<SubPool<B>> {
        self.index.lock().sub_pools.values().map(Arc::clone).collect()
    }
}

/// One rent in progress on a sub-pool of a [`GlobalPool`].
///
/// Dropping the last failed rent of a sub-pool that was created for it removes that sub-pool
/// again, unless it has gained live instances in the meantime.
struct PendingRent<'a, B: Backend> {
    global: &'a GlobalPool<B>,
    kind: &'a Kind<B>,
    pool: SubPool<B>,
    succeeded: bool,
}

impl<B: Backend> Drop for PendingRent<'_, B> {
    fn drop(&mut self) {
        let mut index = self.global.index.lock();

        let Some(pending) = index.pending.get_mut(self.kind) else {
            return;
        };

        if self.succeeded {
            pending.fresh = false;
        }

        pending.renting = pending.renting.saturating_sub(1);

        if pending.renting > 0 {
            return;
        }

        let fresh = pending.fresh;
        index.pending.remove(self.kind);

        if !fresh {
            return;
        }

        let unused = index
            .sub_pools
            .get(self.kind)
            .is_some_and(|current| Arc::ptr_eq(current, &self.pool))
            && self.pool.live_count() == 0;

        if unused {
            index.sub_pools.remove(self.kind);
            debug!(source = ?self.kind.source(), "discarded sub-pool created by a failed rent");
        }
    }
}

fn on_sub_pool_signal<B: Backend>(
    index: &Weak<Mutex<Index<B>>>,
    source: Option<&B::Source>,
    signal: PoolSignal,
) {
    let Some(index) = index.upgrade() else {
        return;
    };

    match signal {
        PoolSignal::Returned(id) | PoolSignal::Destroyed(id) => {
            let mut index = index.lock();
            index.owner_of.remove(&id);

            if let Some(source) = source {
                index.aliases.remove(source);
            }
        }
        PoolSignal::Emptied => {
            debug!(?source, "every instance of the sub-pool has been destroyed");
        }
    }
}

impl<B: Backend> Returnable<B::Instance> for GlobalPool<B> {
    fn return_to_pool(&self, instance: B::Instance) {
        if let Err(error) = self.return_instance(instance) {
            trace!(%error, "returnable could not route the instance");
        }
    }
}

impl<B: Backend> fmt::Debug for GlobalPool<B> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index.lock();

        f.debug_struct("GlobalPool")
            .field("sub_pools", &index.sub_pools.len())
            .field("rented", &index.owner_of.len())
            .field("aliases", &index.aliases.len())
            .field("alias_placement", &self.alias_placement)
            .field("alias_prepool_count", &self.alias_prepool_count)
            .finish_non_exhaustive()
    }
}

/// Builder for creating an instance of [`GlobalPool`].
#[must_use]
pub struct GlobalPoolBuilder<B: Backend> {
    backend: Arc<B>,
    alias_placement: Option<B::Placement>,
    alias_prepool_count: usize,
    tracker: Option<Arc<Tracker>>,
    untracked: bool,
}

impl<B: Backend> GlobalPoolBuilder<B> {
    fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            alias_placement: None,
            alias_prepool_count: 0,
            tracker: None,
            untracked: false,
        }
    }

    /// Placement of kinds created for [`GlobalPool::rent_source()`].
    pub fn alias_placement(mut self, placement: B::Placement) -> Self {
        self.alias_placement = Some(placement);
        self
    }

    /// Prepool count of kinds created for [`GlobalPool::rent_source()`].
    pub fn alias_prepool_count(mut self, count: usize) -> Self {
        self.alias_prepool_count = count;
        self
    }

    /// Sub-pools report to `tracker` instead of the process-wide tracker.
    pub fn tracker(mut self, tracker: Arc<Tracker>) -> Self {
        self.tracker = Some(tracker);
        self.untracked = false;
        self
    }

    /// Sub-pools do not report to any tracker.
    pub fn untracked(mut self) -> Self {
        self.tracker = None;
        self.untracked = true;
        self
    }

    /// Builds the global pool.
    #[must_use]
    pub fn build(self) -> GlobalPool<B> {
        let tracker = if self.untracked {
            None
        } else {
            self.tracker.or_else(Tracker::global)
        };

        GlobalPool {
            backend: self.backend,
            index: Arc::new(Mutex::new(Index::default())),
            alias_placement: self.alias_placement,
            alias_prepool_count: self.alias_prepool_count,
            tracker,
        }
    }
}

impl<B: Backend> fmt::Debug for GlobalPoolBuilder<B> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPoolBuilder")
            .field("alias_placement", &self.alias_placement)
            .field("alias_prepool_count", &self.alias_prepool_count)
            .field("tracker", &self.tracker)
            .field("untracked", &self.untracked)
            .finish_non_exhaustive()
    }
}
