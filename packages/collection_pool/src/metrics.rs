//! Metrics for collection pool activity.

use nm::Event;

thread_local! {
    /// A rent had to create a new collection.
    pub(crate) static CREATED: Event = Event::builder()
        .name("collection_pool_created")
        .build();

    /// A rent was served from the pool.
    pub(crate) static REUSED: Event = Event::builder()
        .name("collection_pool_reused")
        .build();

    /// A collection was dropped on return because the pool was full.
    pub(crate) static DISCARDED: Event = Event::builder()
        .name("collection_pool_discarded")
        .build();
}
