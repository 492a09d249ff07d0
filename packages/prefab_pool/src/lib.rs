#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Pools of expensive-to-create resource instances, such as spawned entities backed by
//! assets that take time to load.
//!
//! Instead of destroying an instance when it is no longer needed, it is returned to a pool and
//! handed out again on the next rent. New instances are only created when the pool is empty.
//! Creating an instance may suspend (e.g. while an asset loads) and can be cancelled.
//!
//! # Building blocks
//!
//! - [`DedupQueue`]: the FIFO that holds idle instances, at most once each.
//! - [`Provider`]: creates and destroys the instances of one kind. [`Kind`] is a provider
//!   built from a template (`source`) and a shared [`Backend`] that knows how to instantiate
//!   templates.
//! - [`KindPool`]: a pool of a single kind of instance.
//! - [`GlobalPool`]: many kinds of instances behind one pool, with one [`KindPool`] per kind.
//!   Instances can be returned without naming their kind.
//! - [`Tracker`]: non-retaining occupancy statistics of every pool that reports to it.
//! - [`SharedPools`]: a registry for sharing pools between unrelated parts of a program.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use prefab_pool::{Backend, GlobalPool, Kind, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Spawner;
//!
//! impl Backend for Spawner {
//!     type Source = &'static str;
//!     type Placement = ();
//!     type Instance = Arc<String>;
//!
//!     async fn instantiate(
//!         &self,
//!         source: &&'static str,
//!         _placement: Option<&()>,
//!         _cancel: &CancellationToken,
//!     ) -> Result<Arc<String>> {
//!         Ok(Arc::new(format!("a fresh {source}")))
//!     }
//!
//!     fn release(&self, _instance: Arc<String>) {}
//! }
//!
//! # futures::executor::block_on(async {
//! let spawner = Arc::new(Spawner);
//! let pool = GlobalPool::new(Arc::clone(&spawner));
//!
//! let goblin = Kind::builder(spawner).source("goblin").build();
//!
//! let first = pool.rent(&goblin).await?;
//! pool.return_instance(first)?;
//!
//! // Served from the pool, not created anew.
//! let _second = pool.rent(&goblin).await?;
//! # Ok::<(), prefab_pool::Error>(())
//! # }).unwrap();
//! ```
//!
//! # Destroyed instances
//!
//! Instances may be destroyed by their environment while rented out or even while idle in a
//! pool. Such instances report [`Poolable::is_destroyed()`] and are dropped instead of being
//! pooled or handed out. The environment can also tell a pool directly through a
//! [`DestroyNotifier`].
//!
//! # Metrics
//!
//! Pool activity is recorded as `nm` events (`prefab_pool_created`, `prefab_pool_reused`,
//! `prefab_pool_returned`, `prefab_pool_released` and `prefab_pool_instantiate_ms`).

mod dedup_queue;
mod despawn;
mod error;
mod global_pool;
mod instance;
mod kind_pool;
mod metrics;
mod prepool;
mod provider;
mod shared;
mod tracker;
mod weak_list;

#[cfg(test)]
mod test_backend;

pub use dedup_queue::*;
pub use despawn::*;
pub use error::*;
pub use global_pool::*;
pub use instance::*;
pub use kind_pool::{DestroyNotifier, KindPool, KindPoolBuilder};
pub use prepool::*;
pub use provider::{Backend, Kind, KindBuilder, Provider};
pub use shared::*;
pub use tracker::{
    LabelProvider, STACK_TRACES_ENV_VAR, ShortTypeNames, TRACKING_ENV_VAR, TrackEntry, Tracker,
    TrackerBuilder,
};
pub(crate) use weak_list::WeakList;
