//! Non-retaining occupancy statistics for pools.
//!
//! A [`Tracker`] is an explicit registry of pools. Pools register with it when they are built
//! and report every rental. The tracker only ever keeps weak references to pools and instances,
//! so tracking never extends the lifetime of anything it observes.
//!
//! Tracking is off unless enabled, either when the tracker is built or at runtime. Pools built
//! while tracking is off are never tracked.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tracing::warn;

use crate::{Error, InstanceId, Liveness, Result, WeakList};

/// Environment variable that enables tracking in [`Tracker::from_env()`].
pub const TRACKING_ENV_VAR: &str = "PREFAB_POOL_TRACKING";

/// Environment variable that enables stack trace capture in [`Tracker::from_env()`].
pub const STACK_TRACES_ENV_VAR: &str = "PREFAB_POOL_STACK_TRACES";

const UNKNOWN_LABEL: &str = "<unknown>";

static GLOBAL: OnceLock<Arc<Tracker>> = OnceLock::new();

/// Turns the type name of a pool into the label shown in diagnostics.
///
/// Only invoked when a pool registers with an enabled tracker. A panicking label provider does
/// not affect the pool; the entry gets a placeholder label instead.
#[cfg_attr(test, mockall::automock)]
pub trait LabelProvider: Send + Sync + 'static {
    /// Produces a label for the pool type named `type_name`.
    fn label(&self, type_name: &str) -> String;
}

/// The default [`LabelProvider`]: strips module paths from every type in the name.
///
/// `my_game::pools::KindPool<my_game::assets::Kind<my_game::Loader>>` becomes
/// `KindPool<Kind<Loader>>`.
#[derive(Debug, Default)]
pub struct ShortTypeNames;

impl LabelProvider for ShortTypeNames {
    fn label(&self, type_name: &str) -> String {
        let mut label = String::with_capacity(type_name.len());
        let mut path = String::new();

        for c in type_name.chars() {
            if c.is_alphanumeric() || c == '_' || c == ':' {
                path.push(c);
            } else {
                push_last_segment(&mut label, &path);
                path.clear();
                label.push(c);
            }
        }

        push_last_segment(&mut label, &path);
        label
    }
}

fn push_last_segment(label: &mut String, path: &str) {
    if let Some(segment) = path.rsplit("::").next() {
        label.push_str(segment);
    }
}

/// Something whose idle instance count the tracker can query.
pub(crate) trait Countable: Send + Sync {
    fn inactive_count(&self) -> usize;
}

/// Process-wide (or test-wide) registry of tracked pools.
///
/// # Example
///
/// ```
/// use prefab_pool::Tracker;
///
/// let tracker = Tracker::builder().enabled(true).build();
///
/// // Pools built with `.tracker(Arc::clone(&tracker))` show up here.
/// for entry in tracker.snapshot() {
///     println!("{entry}");
/// }
/// ```
pub struct Tracker {
    enabled: AtomicBool,
    capture_stack_traces: AtomicBool,
    dirty: AtomicBool,
    next_tracking_id: AtomicU64,
    label_provider: Box<dyn LabelProvider>,

    // Several pools may report concurrently.
    registrations: Mutex<HashMap<u64, Registration, RandomState>>,
}

struct Registration {
    pool: Weak<dyn Countable>,
    label: String,
    added_at: SystemTime,
    stack_trace: Option<String>,
    instances: WeakList,
    max_recorded: usize,
}

impl Tracker {
    /// Starts building a tracker.
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    /// Builds a tracker configured from [`TRACKING_ENV_VAR`] and [`STACK_TRACES_ENV_VAR`].
    ///
    /// A variable counts as set when its value is `1` or `true` (any case).
    #[must_use]
    pub fn from_env() -> Arc<Self> {
        Self::builder()
            .enabled(env_flag(TRACKING_ENV_VAR))
            .capture_stack_traces(env_flag(STACK_TRACES_ENV_VAR))
            .build()
    }

    /// Installs the process-wide tracker used by pools that are not given one explicitly.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if a process-wide tracker is already installed.
    pub fn install_global(tracker: Arc<Self>) -> Result<()> {
        GLOBAL
            .set(tracker)
            .map_err(|_rejected| Error::InvalidArgument { name: "tracker" })
    }

    /// The process-wide tracker, if one has been installed.
    #[must_use]
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Whether pools report to this tracker.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turns tracking on or off. Pools built while tracking is off stay untracked.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether a stack trace is captured when a pool registers.
    #[must_use]
    pub fn captures_stack_traces(&self) -> bool {
        self.capture_stack_traces.load(Ordering::Relaxed)
    }

    /// Turns stack trace capture on or off. This is expensive; leave it off unless hunting
    /// for the origin of a pool.
    pub fn set_capture_stack_traces(&self, capture: bool) {
        self.capture_stack_traces.store(capture, Ordering::Relaxed);
    }

    /// Returns whether anything was tracked since the last call, and resets the flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /// Current state of every live tracked pool, ordered by registration.
    ///
    /// Dead instance observers are swept as a side effect, and pools that no longer exist are
    /// forgotten.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackEntry> {
        let mut registrations = self.registrations.lock();
        registrations.retain(|_, registration| registration.pool.strong_count() > 0);

        let mut entries = registrations
            .iter_mut()
            .filter_map(|(tracking_id, registration)| {
                let pool = registration.pool.upgrade()?;

                registration.instances.sweep();
                let alive = registration.instances.alive_count();
                let count_inactive = pool.inactive_count();

                Some(TrackEntry {
                    tracking_id: *tracking_id,
                    label: registration.label.clone(),
                    added_at: registration.added_at,
                    count_inactive,
                    count_active: alive.saturating_sub(count_inactive),
                    max_recorded: registration.max_recorded,
                    stack_trace: registration.stack_trace.clone(),
                })
            })
            .collect::<Vec<_>>();

        entries.sort_by_key(|entry| entry.tracking_id);
        entries
    }

    /// Entries of all tracked pools that share a label, e.g. to find accidental duplicates.
    #[must_use]
    pub fn entries_with_label(&self, label: &str) -> Vec<TrackEntry> {
        self.snapshot()
            .into_iter()
            .filter(|entry| entry.label == label)
            .collect()
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        pool: Weak<dyn Countable>,
        type_name: &'static str,
    ) -> Option<Tracking> {
        self.dirty.store(true, Ordering::Relaxed);

        if !self.is_enabled() {
            return None;
        }

        let stack_trace = self
            .captures_stack_traces()
            .then(|| Backtrace::force_capture().to_string());

        let tracking_id = self.next_tracking_id.fetch_add(1, Ordering::Relaxed);

        let registration = Registration {
            pool,
            label: self.label_for(type_name),
            added_at: SystemTime::now(),
            stack_trace,
            instances: WeakList::default(),
            max_recorded: 0,
        };

        self.registrations.lock().insert(tracking_id, registration);

        Some(Tracking {
            tracker: Arc::clone(self),
            tracking_id,
        })
    }

    fn label_for(&self, type_name: &str) -> String {
        panic::catch_unwind(AssertUnwindSafe(|| self.label_provider.label(type_name)))
            .unwrap_or_else(|_payload| {
                warn!(type_name, "label provider panicked, using a placeholder label");
                UNKNOWN_LABEL.to_owned()
            })
    }

    fn record_rent_or_create(
        &self,
        tracking_id: u64,
        id: InstanceId,
        liveness: Option<Liveness>,
    ) {
        if !self.is_enabled() {
            return;
        }

        self.dirty.store(true, Ordering::Relaxed);

        let mut registrations = self.registrations.lock();
        let Some(registration) = registrations.get_mut(&tracking_id) else {
            warn!(tracking_id, "instance reported for a pool that is not tracked");
            return;
        };

        if let Some(liveness) = liveness {
            registration.instances.observe(id, liveness);
        }

        registration.max_recorded = registration
            .max_recorded
            .max(registration.instances.len());
    }
}

impl fmt::Debug for Tracker {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("enabled", &self.is_enabled())
            .field("capture_stack_traces", &self.captures_stack_traces())
            .field("pools", &self.registrations.lock().len())
            .finish_non_exhaustive()
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

/// Builder for creating an instance of [`Tracker`].
#[must_use]
pub struct TrackerBuilder {
    enabled: bool,
    capture_stack_traces: bool,
    label_provider: Box<dyn LabelProvider>,
}

impl TrackerBuilder {
    fn new() -> Self {
        Self {
            enabled: false,
            capture_stack_traces: false,
            label_provider: Box::new(ShortTypeNames),
        }
    }

    /// Whether pools report to the tracker. Defaults to `false`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether to capture a stack trace when a pool registers. Defaults to `false`.
    pub fn capture_stack_traces(mut self, capture: bool) -> Self {
        self.capture_stack_traces = capture;
        self
    }

    /// Replaces the default [`ShortTypeNames`] label provider.
    pub fn label_provider(mut self, provider: impl LabelProvider) -> Self {
        self.label_provider = Box::new(provider);
        self
    }

    /// Builds the tracker.
    #[must_use]
    pub fn build(self) -> Arc<Tracker> {
        Arc::new(Tracker {
            enabled: AtomicBool::new(self.enabled),
            capture_stack_traces: AtomicBool::new(self.capture_stack_traces),
            dirty: AtomicBool::new(false),
            next_tracking_id: AtomicU64::new(1),
            label_provider: self.label_provider,
            registrations: Mutex::new(HashMap::default()),
        })
    }
}

impl fmt::Debug for TrackerBuilder {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerBuilder")
            .field("enabled", &self.enabled)
            .field("capture_stack_traces", &self.capture_stack_traces)
            .finish_non_exhaustive()
    }
}

/// A pool's registration with a tracker.
#[derive(Debug)]
pub(crate) struct Tracking {
    tracker: Arc<Tracker>,
    tracking_id: u64,
}

impl Tracking {
    pub(crate) fn record_rent_or_create(&self, id: InstanceId, liveness: Option<Liveness>) {
        self.tracker
            .record_rent_or_create(self.tracking_id, id, liveness);
    }

    pub(crate) fn record_return_or_release(&self) {
        self.tracker.dirty.store(true, Ordering::Relaxed);
    }
}

/// Snapshot of one tracked pool.
#[derive(Clone, Debug)]
pub struct TrackEntry {
    tracking_id: u64,
    label: String,
    added_at: SystemTime,
    count_inactive: usize,
    count_active: usize,
    max_recorded: usize,
    stack_trace: Option<String>,
}

impl TrackEntry {
    /// Unique, increasing identifier of the registration.
    #[must_use]
    pub fn tracking_id(&self) -> u64 {
        self.tracking_id
    }

    /// Label produced by the tracker's [`LabelProvider`].
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// When the pool registered.
    #[must_use]
    pub fn added_at(&self) -> SystemTime {
        self.added_at
    }

    /// Number of instances waiting in the pool.
    #[must_use]
    pub fn count_inactive(&self) -> usize {
        self.count_inactive
    }

    /// Number of instances rented from the pool that are still alive.
    #[must_use]
    pub fn count_active(&self) -> usize {
        self.count_active
    }

    /// Highest number of instances observed at once when an instance was created or rented.
    ///
    /// Instances that died are only discounted once the tracker sweeps them, so this can run
    /// ahead of the true peak by the number of recently dropped instances.
    #[must_use]
    pub fn max_recorded(&self) -> usize {
        self.max_recorded
    }

    /// Where the pool was created, if stack trace capture was on at the time.
    #[must_use]
    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }
}

impl fmt::Display for TrackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (tracking id {}): {} inactive, {} active, {} max",
            self.label, self.tracking_id, self.count_inactive, self.count_active, self.max_recorded
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Poolable;

    assert_impl_all!(Tracker: Send, Sync);
    assert_impl_all!(TrackEntry: Send, Sync, Clone);

    struct FixedCount(usize);

    impl Countable for FixedCount {
        fn inactive_count(&self) -> usize {
            self.0
        }
    }

    fn register(tracker: &Arc<Tracker>, pool: &Arc<FixedCount>) -> Option<Tracking> {
        let countable: Arc<dyn Countable> = Arc::<FixedCount>::clone(pool);
        tracker.register(Arc::downgrade(&countable), "my_game::pools::EnemyPool")
    }

    #[test]
    fn short_type_names_strip_paths() {
        let label = ShortTypeNames.label(
            "prefab_pool::kind_pool::KindPool<prefab_pool::provider::Kind<game::Loader>>",
        );

        assert_eq!(label, "KindPool<Kind<Loader>>");
        assert_eq!(ShortTypeNames.label("(u32, alloc::string::String)"), "(u32, String)");
    }

    #[test]
    fn disabled_tracker_does_not_register() {
        let tracker = Tracker::builder().build();
        let pool = Arc::new(FixedCount(0));

        assert!(register(&tracker, &pool).is_none());
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn registered_pool_shows_up_in_snapshot() {
        let tracker = Tracker::builder().enabled(true).build();
        let pool = Arc::new(FixedCount(3));

        let _tracking = register(&tracker, &pool).unwrap();

        let entries = tracker.snapshot();
        assert_eq!(entries.len(), 1);

        let entry = entries.first().unwrap();
        assert_eq!(entry.label(), "EnemyPool");
        assert_eq!(entry.count_inactive(), 3);
        assert_eq!(entry.count_active(), 0);
        assert!(entry.stack_trace().is_none());
    }

    #[test]
    fn dropped_pool_is_forgotten() {
        let tracker = Tracker::builder().enabled(true).build();
        let pool = Arc::new(FixedCount(0));
        let _tracking = register(&tracker, &pool).unwrap();

        drop(pool);

        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn dropped_instance_is_not_counted_after_sweep() {
        let tracker = Tracker::builder().enabled(true).build();
        let pool = Arc::new(FixedCount(0));
        let tracking = register(&tracker, &pool).unwrap();

        let kept = Arc::new("kept");
        let dropped = Arc::new("dropped");
        tracking.record_rent_or_create(kept.instance_id(), kept.liveness());
        tracking.record_rent_or_create(dropped.instance_id(), dropped.liveness());

        assert_eq!(tracker.snapshot().first().unwrap().count_active(), 2);

        drop(dropped);

        let entry = tracker.snapshot().into_iter().next().unwrap();
        assert_eq!(entry.count_active(), 1);
        assert_eq!(entry.max_recorded(), 2);
    }

    #[test]
    fn rerenting_same_instance_does_not_raise_max() {
        let tracker = Tracker::builder().enabled(true).build();
        let pool = Arc::new(FixedCount(0));
        let tracking = register(&tracker, &pool).unwrap();

        let instance = Arc::new(7_u16);
        for _ in 0..10 {
            tracking.record_rent_or_create(instance.instance_id(), instance.liveness());
        }

        let entry = tracker.snapshot().into_iter().next().unwrap();
        assert_eq!(entry.count_active(), 1);
        assert_eq!(entry.max_recorded(), 1);
    }

    #[test]
    fn stack_trace_captured_when_enabled() {
        let tracker = Tracker::builder()
            .enabled(true)
            .capture_stack_traces(true)
            .build();
        let pool = Arc::new(FixedCount(0));
        let _tracking = register(&tracker, &pool).unwrap();

        let entry = tracker.snapshot().into_iter().next().unwrap();
        assert!(entry.stack_trace().is_some());
    }

    #[test]
    fn label_provider_is_consulted_once_per_registration() {
        let mut provider = MockLabelProvider::new();
        provider
            .expect_label()
            .times(1)
            .returning(|type_name| format!("custom:{type_name}"));

        let tracker = Tracker::builder()
            .enabled(true)
            .label_provider(provider)
            .build();
        let pool = Arc::new(FixedCount(0));
        let _tracking = register(&tracker, &pool).unwrap();

        let entries = tracker.entries_with_label("custom:my_game::pools::EnemyPool");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn panicking_label_provider_gets_placeholder() {
        struct Exploding;

        impl LabelProvider for Exploding {
            fn label(&self, _type_name: &str) -> String {
                panic!("formatting failed");
            }
        }

        let tracker = Tracker::builder()
            .enabled(true)
            .label_provider(Exploding)
            .build();
        let pool = Arc::new(FixedCount(0));
        let _tracking = register(&tracker, &pool).unwrap();

        assert_eq!(tracker.entries_with_label(UNKNOWN_LABEL).len(), 1);
    }

    #[test]
    fn dirty_flag_is_taken() {
        let tracker = Tracker::builder().enabled(true).build();
        assert!(!tracker.take_dirty());

        let pool = Arc::new(FixedCount(0));
        let tracking = register(&tracker, &pool).unwrap();
        assert!(tracker.take_dirty());
        assert!(!tracker.take_dirty());

        tracking.record_return_or_release();
        assert!(tracker.take_dirty());
    }

    #[test]
    fn disabling_stops_rent_recording() {
        let tracker = Tracker::builder().enabled(true).build();
        let pool = Arc::new(FixedCount(0));
        let tracking = register(&tracker, &pool).unwrap();

        tracker.set_enabled(false);

        let instance = Arc::new(1_u8);
        tracking.record_rent_or_create(instance.instance_id(), instance.liveness());

        tracker.set_enabled(true);
        assert_eq!(tracker.snapshot().first().unwrap().count_active(), 0);
    }
}
