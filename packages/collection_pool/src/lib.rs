#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Pools of reusable standard collections.
//!
//! Building a temporary `Vec`, `HashMap` or `String` in a hot loop allocates every time. A
//! [`CollectionPool`] keeps returned collections around, emptied but with their capacity
//! intact, so the next user can fill them without allocating.
//!
//! ```
//! use collection_pool::HashSetPool;
//!
//! let pool = HashSetPool::<&str>::new();
//!
//! {
//!     let mut seen = pool.rent_scoped();
//!     seen.insert("goblin");
//!     seen.insert("goblin");
//!     assert_eq!(seen.len(), 1);
//! } // Returned to the pool here.
//!
//! assert_eq!(pool.len(), 1);
//! ```
//!
//! Any type can be pooled by implementing [`Recycle`] for it.

mod metrics;
mod pool;
mod recycle;

pub use pool::*;
pub use recycle::*;
