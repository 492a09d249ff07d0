use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::Recycle;
use crate::metrics::{CREATED, DISCARDED, REUSED};

/// A pool of [`Vec`]s.
pub type VecPool<T> = CollectionPool<Vec<T>>;

/// A pool of [`VecDeque`]s.
pub type VecDequePool<T> = CollectionPool<VecDeque<T>>;

/// A pool of [`HashMap`]s.
pub type HashMapPool<K, V> = CollectionPool<HashMap<K, V>>;

/// A pool of [`HashSet`]s.
pub type HashSetPool<T> = CollectionPool<HashSet<T>>;

/// A pool of [`BTreeMap`]s.
pub type BTreeMapPool<K, V> = CollectionPool<BTreeMap<K, V>>;

/// A pool of [`BTreeSet`]s.
pub type BTreeSetPool<T> = CollectionPool<BTreeSet<T>>;

/// A pool of [`String`]s.
pub type StringPool = CollectionPool<String>;

/// A thread-safe pool of reusable collections.
///
/// Collections are recycled (emptied, keeping their capacity) when returned, so the next
/// renter receives an empty collection that usually does not need to allocate.
///
/// # Example
///
/// ```
/// use collection_pool::VecPool;
///
/// let pool = VecPool::<u32>::new();
///
/// let mut scratch = pool.rent();
/// scratch.extend([1, 2, 3]);
/// pool.return_one(scratch);
///
/// let reused = pool.rent();
/// assert!(reused.is_empty());
/// assert!(reused.capacity() >= 3);
/// ```
pub struct CollectionPool<T> {
    items: Mutex<VecDeque<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    max_retained: Option<usize>,
}

impl<T> CollectionPool<T>
where
    T: Recycle + Send + 'static,
{
    /// Creates an empty pool that creates new collections with [`Default`].
    #[must_use]
    pub fn new() -> Self
    where
        T: Default,
    {
        Self::with_factory(T::default)
    }

    /// Creates an empty pool that creates new collections with `factory`.
    ///
    /// Use this to pre-size new collections.
    #[must_use]
    pub fn with_factory(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            factory: Box::new(factory),
            max_retained: None,
        }
    }

    /// Limits how many idle collections the pool keeps. Collections returned to a full pool
    /// are dropped.
    #[must_use]
    pub fn with_max_retained(mut self, max_retained: usize) -> Self {
        self.max_retained = Some(max_retained);
        self
    }

    /// Takes an idle collection from the pool or creates a new one.
    #[must_use]
    pub fn rent(&self) -> T {
        if let Some(item) = self.items.lock().pop_front() {
            REUSED.with(|e| e.observe_once());
            return item;
        }

        CREATED.with(|e| e.observe_once());
        (self.factory)()
    }

    /// Like [`rent()`](CollectionPool::rent), but returns the collection to the pool when the
    /// guard is dropped.
    #[must_use]
    pub fn rent_scoped(&self) -> Rented<'_, T>
    where
        T: Default,
    {
        Rented {
            pool: self,
            item: self.rent(),
            detached: false,
        }
    }

    /// Recycles `item` and keeps it for the next rent.
    pub fn return_one(&self, mut item: T) {
        item.recycle();

        let mut items = self.items.lock();

        if self.max_retained.is_some_and(|max| items.len() >= max) {
            drop(items);
            DISCARDED.with(|e| e.observe_once());
            trace!("pool is full, dropping returned collection");
            return;
        }

        items.push_back(item);
    }

    /// Recycles and keeps every collection yielded by `items`.
    pub fn return_many(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.return_one(item);
        }
    }

    /// Drops idle collections, oldest first, until at most `keep` remain. Returns how many
    /// were dropped.
    pub fn release_excess(&self, keep: usize) -> usize {
        let excess = {
            let mut items = self.items.lock();
            let count = items.len().saturating_sub(keep);
            items.drain(..count).collect::<Vec<_>>()
        };

        let released = excess.len();

        if released > 0 {
            debug!(released, keep, "released excess collections");
        }

        released
    }

    /// Number of idle collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether there are no idle collections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for CollectionPool<T>
where
    T: Recycle + Default + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CollectionPool<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionPool")
            .field("len", &self.items.lock().len())
            .field("max_retained", &self.max_retained)
            .finish_non_exhaustive()
    }
}

/// A collection rented with [`CollectionPool::rent_scoped()`]. Returned to the pool on drop.
pub struct Rented<'a, T>
where
    T: Recycle + Default + Send + 'static,
{
    pool: &'a CollectionPool<T>,
    item: T,
    detached: bool,
}

impl<T> Rented<'_, T>
where
    T: Recycle + Default + Send + 'static,
{
    /// Keeps the collection instead of returning it to the pool.
    #[must_use]
    pub fn into_inner(mut self) -> T {
        self.detached = true;
        mem::take(&mut self.item)
    }
}

impl<T> Deref for Rented<'_, T>
where
    T: Recycle + Default + Send + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Rented<'_, T>
where
    T: Recycle + Default + Send + 'static,
{
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T> Drop for Rented<'_, T>
where
    T: Recycle + Default + Send + 'static,
{
    fn drop(&mut self) {
        if !self.detached {
            self.pool.return_one(mem::take(&mut self.item));
        }
    }
}

impl<T> fmt::Debug for Rented<'_, T>
where
    T: Recycle + Default + Send + 'static + fmt::Debug,
{
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rented")
            .field("item", &self.item)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}
