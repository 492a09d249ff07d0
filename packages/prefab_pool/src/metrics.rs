//! Metrics for pool activity.
//!
//! The metrics use per-thread event instances to minimize contention.

use nm::{Event, Magnitude};

/// Histogram buckets for instantiation time in milliseconds.
///
/// Instantiation covers anything from constructing a plain value to loading an asset from
/// storage, so we expect a wide distribution.
const INSTANTIATE_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 250, 500, 1000, 5000];

thread_local! {
    /// A rent had to create a new instance.
    pub(crate) static CREATED: Event = Event::builder()
        .name("prefab_pool_created")
        .build();

    /// A rent was served from the queue.
    pub(crate) static REUSED: Event = Event::builder()
        .name("prefab_pool_reused")
        .build();

    /// An instance was returned to a pool.
    pub(crate) static RETURNED: Event = Event::builder()
        .name("prefab_pool_returned")
        .build();

    /// A pooled instance was permanently released.
    pub(crate) static RELEASED: Event = Event::builder()
        .name("prefab_pool_released")
        .build();

    /// Time spent inside the provider creating one instance.
    pub(crate) static INSTANTIATE_MS: Event = Event::builder()
        .name("prefab_pool_instantiate_ms")
        .histogram(INSTANTIATE_MS_BUCKETS)
        .build();
}
