use std::any::type_name;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics::{RELEASED, RETURNED, REUSED};
use crate::provider::create;
use crate::tracker::{Countable, Tracking};
use crate::{DedupQueue, Error, InstanceId, Poolable, Provider, Result, Returnable, Tracker};

/// A pool of instances of a single kind of resource.
///
/// Renting takes the oldest queued instance or, when the queue is empty, asks the provider to
/// create a new one. Creation may suspend and can be cancelled. All bookkeeping is
/// synchronous; the internal lock is never held across a suspension point.
///
/// The pool holds each instance at most once. Returning an instance that is already queued
/// replaces the queued copy in place instead of adding a second entry.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use prefab_pool::{Backend, Kind, KindPool, Result};
/// # use tokio_util::sync::CancellationToken;
/// # struct Loader;
/// # impl Backend for Loader {
/// #     type Source = &'static str;
/// #     type Placement = ();
/// #     type Instance = Arc<String>;
/// #     async fn instantiate(&self, source: &&'static str, _: Option<&()>, _: &CancellationToken) -> Result<Arc<String>> {
/// #         Ok(Arc::new(source.to_string()))
/// #     }
/// #     fn release(&self, _: Arc<String>) {}
/// # }
/// # futures::executor::block_on(async {
/// let kind = Kind::builder(Arc::new(Loader)).source("bullet").build();
/// let pool = KindPool::new(kind);
///
/// let bullet = pool.rent().await?;
/// pool.return_instance(bullet);
///
/// assert_eq!(pool.len(), 1);
/// # Ok::<(), prefab_pool::Error>(())
/// # }).unwrap();
/// ```
pub struct KindPool<P: Provider> {
    provider: P,
    shared: Arc<Shared<P::Instance, P::Placement>>,
}

/// Notifications a pool sends to the one subscriber that routes instances into it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PoolSignal {
    /// An instance was queued by a return.
    Returned(InstanceId),

    /// An instance was destroyed outside of the pool.
    Destroyed(InstanceId),

    /// The last instance created by the pool was destroyed.
    Emptied,
}

type SignalHandler = Box<dyn Fn(PoolSignal) + Send + Sync>;

/// The part of the pool that outlives borrows: destroy notifiers and the tracker hold weak
/// references to it.
struct Shared<T, Pl> {
    state: Mutex<State<T, Pl>>,
    signals: OnceLock<SignalHandler>,
    tracking: Option<Tracking>,
}

struct State<T, Pl> {
    queue: DedupQueue<InstanceId, T>,

    // Instances this pool has produced or accepted that are neither released nor destroyed.
    live: HashSet<InstanceId, RandomState>,

    placement: Option<Pl>,
}

impl<P: Provider> KindPool<P> {
    /// Creates an empty pool that reports to the process-wide tracker, if one is installed.
    pub fn new(provider: P) -> Self {
        Self::with_tracker(provider, Tracker::global())
    }

    /// Starts building a pool.
    pub fn builder() -> KindPoolBuilder<P> {
        KindPoolBuilder::new()
    }

    pub(crate) fn with_tracker(provider: P, tracker: Option<Arc<Tracker>>) -> Self {
        let placement = provider.placement().cloned();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<P::Instance, P::Placement>>| {
            let countable: Weak<dyn Countable> =
                Weak::<Shared<P::Instance, P::Placement>>::clone(weak);

            Shared {
                state: Mutex::new(State {
                    queue: DedupQueue::new(),
                    live: HashSet::default(),
                    placement,
                }),
                signals: OnceLock::new(),
                tracking: tracker
                    .and_then(|tracker| tracker.register(countable, type_name::<Self>())),
            }
        });

        Self { provider, shared }
    }

    /// Rents an instance, creating one if none is queued.
    ///
    /// # Errors
    ///
    /// Whatever the provider fails with when a new instance is needed, such as
    /// [`Error::SourceMissing`].
    pub async fn rent(&self) -> Result<P::Instance> {
        self.rent_with(&CancellationToken::new()).await
    }

    /// Rents an instance, giving up if `cancel` is cancelled before one is available.
    ///
    /// A cancelled rent leaves the pool exactly as it was.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] on cancellation, or whatever the provider fails with when a new
    /// instance is needed.
    pub async fn rent_with(&self, cancel: &CancellationToken) -> Result<P::Instance> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(instance) = self.take_queued() {
            REUSED.with(|e| e.observe_once());
            trace!(id = %instance.instance_id(), "rented a queued instance");

            self.track_instance(&instance);
            return Ok(instance);
        }

        let instance = self.create_live(cancel).await?;
        trace!(id = %instance.instance_id(), "rented a new instance");

        Ok(instance)
    }

    /// Hands an instance back to the pool.
    ///
    /// Instances already destroyed by their environment are dropped instead of queued.
    pub fn return_instance(&self, mut instance: P::Instance) {
        let id = instance.instance_id();

        if instance.is_destroyed() {
            trace!(%id, "dropping returned instance that was already destroyed");
            drop(instance);
            self.shared.instance_destroyed(id);
            return;
        }

        let placement = self.placement();
        self.provider.on_return(&mut instance, placement.as_ref());

        let replaced = {
            let mut state = self.shared.state.lock();
            state.live.insert(id);
            state.queue.enqueue(id, instance)
        };

        if replaced.is_some() {
            trace!(%id, "instance was already queued, replaced the queued copy");
        }

        RETURNED.with(|e| e.observe_once());

        if let Some(tracking) = &self.shared.tracking {
            tracking.record_return_or_release();
        }

        self.shared.emit(PoolSignal::Returned(id));
    }

    /// Hands back every instance yielded by `instances`.
    pub fn return_many(&self, instances: impl IntoIterator<Item = P::Instance>) {
        for instance in instances {
            self.return_instance(instance);
        }
    }

    /// Releases queued instances through the provider until at most `keep` remain.
    ///
    /// The oldest instances are released first. Returns how many were released.
    pub fn release_excess(&self, keep: usize) -> usize {
        self.release_excess_with(keep, |instance| self.provider.release(instance))
    }

    /// Removes queued instances until at most `keep` remain, passing each one to
    /// `on_released` instead of the provider.
    pub fn release_excess_with(&self, keep: usize, mut on_released: impl FnMut(P::Instance)) -> usize {
        let excess = {
            let mut state = self.shared.state.lock();
            let mut excess = Vec::with_capacity(state.queue.len().saturating_sub(keep));

            while state.queue.len() > keep {
                let Some((id, instance)) = state.queue.dequeue() else {
                    break;
                };

                state.live.remove(&id);
                excess.push(instance);
            }

            excess
        };

        let released = excess.len();

        for instance in excess {
            on_released(instance);
        }

        if released > 0 {
            RELEASED.with(|e| e.batch(released).observe_once());
            debug!(released, keep, "released excess instances");

            if let Some(tracking) = &self.shared.tracking {
                tracking.record_return_or_release();
            }
        }

        released
    }

    /// Releases every queued instance and drops the pool.
    ///
    /// Instances that are rented out at this point are not affected.
    pub fn dispose(self) {
        let released = self.drain_and_release();
        debug!(released, "disposed pool");
    }

    pub(crate) fn drain_and_release(&self) -> usize {
        self.release_excess(0)
    }

    /// Fills the queue with the provider's prepool count of new instances.
    ///
    /// If the pool has no placement yet, it adopts `default_placement` for these and all later
    /// instances. Instances created before a cancellation stay in the pool.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] on cancellation, or whatever the provider fails with.
    pub async fn prepool(
        &self,
        default_placement: Option<P::Placement>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let count = self.provider.prepool_count();

        if count == 0 {
            return Ok(());
        }

        {
            let mut state = self.shared.state.lock();
            if state.placement.is_none() {
                state.placement = default_placement;
            }
        }

        for _ in 0..count {
            let instance = self.create_live(cancel).await?;
            self.return_instance(instance);
        }

        debug!(count, "prepooled instances");
        Ok(())
    }

    /// Number of queued instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether no instances are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }

    /// Number of instances known to the pool that have been neither released nor destroyed,
    /// whether queued or rented out.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// The provider that creates and releases instances.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The placement new and returned instances receive.
    #[must_use]
    pub fn placement(&self) -> Option<P::Placement> {
        self.shared.state.lock().placement.clone()
    }

    /// A handle the environment of the instances uses to report that an instance was
    /// destroyed outside of the pool.
    #[must_use]
    pub fn destroy_notifier(&self) -> DestroyNotifier {
        let target: Weak<dyn DestroyTarget> =
            Arc::<Shared<P::Instance, P::Placement>>::downgrade(&self.shared);

        DestroyNotifier { target }
    }

    /// Registers the one handler that receives this pool's signals.
    ///
    /// Only the first registration takes effect.
    pub(crate) fn subscribe(&self, handler: impl Fn(PoolSignal) + Send + Sync + 'static) {
        if self.shared.signals.set(Box::new(handler)).is_err() {
            debug!("pool already has a signal subscriber, ignoring the new one");
        }
    }

    async fn create_live(&self, cancel: &CancellationToken) -> Result<P::Instance> {
        let placement = self.placement();
        let instance = create(&self.provider, placement.as_ref(), cancel).await?;

        self.shared
            .state
            .lock()
            .live
            .insert(instance.instance_id());

        self.track_instance(&instance);
        Ok(instance)
    }

    fn take_queued(&self) -> Option<P::Instance> {
        loop {
            let (id, instance, emptied) = {
                let mut state = self.shared.state.lock();
                let (id, instance) = state.queue.dequeue()?;

                if !instance.is_destroyed() {
                    return Some(instance);
                }

                let was_live = state.live.remove(&id);
                (id, instance, was_live && state.live.is_empty())
            };

            trace!(%id, "skipping queued instance that was destroyed");
            drop(instance);
            self.shared.announce_destroyed(id, emptied);
        }
    }

    fn track_instance(&self, instance: &P::Instance) {
        if let Some(tracking) = &self.shared.tracking {
            tracking.record_rent_or_create(instance.instance_id(), instance.liveness());
        }
    }
}

impl<T, Pl> Shared<T, Pl> {
    fn emit(&self, signal: PoolSignal) {
        if let Some(handler) = self.signals.get() {
            handler(signal);
        }
    }

    fn announce_destroyed(&self, id: InstanceId, emptied: bool) {
        self.emit(PoolSignal::Destroyed(id));

        if emptied {
            debug!("last live instance of the pool was destroyed");
            self.emit(PoolSignal::Emptied);
        }
    }
}

impl<T, Pl> Countable for Shared<T, Pl>
where
    T: Send,
    Pl: Send + Sync,
{
    fn inactive_count(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Receives reports of instances destroyed outside of their pool.
trait DestroyTarget: Send + Sync {
    fn instance_destroyed(&self, id: InstanceId);
}

impl<T, Pl> DestroyTarget for Shared<T, Pl>
where
    T: Send,
    Pl: Send + Sync,
{
    fn instance_destroyed(&self, id: InstanceId) {
        let (removed, emptied) = {
            let mut state = self.state.lock();
            let removed = state.queue.remove(&id);
            let was_live = state.live.remove(&id);
            (removed, was_live && state.live.is_empty())
        };

        drop(removed);
        self.announce_destroyed(id, emptied);
    }
}

/// Reports instances destroyed outside of their pool.
///
/// Obtained from [`KindPool::destroy_notifier()`] or [`GlobalPool::destroy_notifier_for()`].
/// Holding a notifier does not keep the pool alive; notifications sent after the pool is gone
/// are ignored.
///
/// [`GlobalPool::destroy_notifier_for()`]: crate::GlobalPool::destroy_notifier_for
#[derive(Clone)]
pub struct DestroyNotifier {
    target: Weak<dyn DestroyTarget>,
}

impl DestroyNotifier {
    /// Tells the pool that the instance `id` no longer exists.
    ///
    /// The instance is removed from the queue if it was queued. Notifying for an unknown
    /// instance does nothing.
    pub fn notify_destroyed(&self, id: InstanceId) {
        if let Some(target) = self.target.upgrade() {
            target.instance_destroyed(id);
        }
    }
}

impl fmt::Debug for DestroyNotifier {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyNotifier")
            .field("pool_alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl<P: Provider> Returnable<P::Instance> for KindPool<P> {
    fn return_to_pool(&self, instance: P::Instance) {
        self.return_instance(instance);
    }
}

impl<P: Provider> fmt::Debug for KindPool<P> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();

        f.debug_struct("KindPool")
            .field("len", &state.queue.len())
            .field("live", &state.live.len())
            .field("placement", &state.placement)
            .field("tracked", &self.shared.tracking.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for creating an instance of [`KindPool`].
#[must_use]
pub struct KindPoolBuilder<P: Provider> {
    provider: Option<P>,
    tracker: Option<Arc<Tracker>>,
    untracked: bool,
}

impl<P: Provider> KindPoolBuilder<P> {
    fn new() -> Self {
        Self {
            provider: None,
            tracker: None,
            untracked: false,
        }
    }

    /// Sets the provider that creates and releases the instances. Required.
    pub fn provider(mut self, provider: P) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Reports to `tracker` instead of the process-wide tracker.
    pub fn tracker(mut self, tracker: Arc<Tracker>) -> Self {
        self.tracker = Some(tracker);
        self.untracked = false;
        self
    }

    /// Does not report to any tracker.
    pub fn untracked(mut self) -> Self {
        self.tracker = None;
        self.untracked = true;
        self
    }

    /// Builds the pool.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if no provider was set.
    pub fn build(self) -> Result<KindPool<P>> {
        let provider = self
            .provider
            .ok_or(Error::InvalidArgument { name: "provider" })?;

        let tracker = if self.untracked {
            None
        } else {
            self.tracker.or_else(Tracker::global)
        };

        Ok(KindPool::with_tracker(provider, tracker))
    }
}

impl<P: Provider> fmt::Debug for KindPoolBuilder<P> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindPoolBuilder")
            .field("has_provider", &self.provider.is_some())
            .field("tracker", &self.tracker)
            .field("untracked", &self.untracked)
            .finish()
    }
}
