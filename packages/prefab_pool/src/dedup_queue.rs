use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::iter;
use std::mem;

use foldhash::fast::RandomState;

/// Below this many order slots we never bother compacting.
const COMPACT_THRESHOLD: usize = 64;

/// A first-in-first-out queue that holds at most one entry per key.
///
/// Enqueueing a key that is already present replaces the stored value in place, keeping the
/// original queue position. This makes a duplicate "return to pool" a harmless no-op instead of
/// a second slot that would later be handed out twice.
///
/// Specific entries can be removed by key. The order buffer is cleaned up lazily: removed or
/// replaced entries leave a stale slot behind that is skipped on dequeue and compacted away once
/// stale slots dominate.
///
/// # Example
///
/// ```
/// use prefab_pool::DedupQueue;
///
/// let mut queue = DedupQueue::new();
/// queue.enqueue(1, "first");
/// queue.enqueue(2, "second");
/// queue.enqueue(1, "first again");
///
/// assert_eq!(queue.len(), 2);
/// assert_eq!(queue.dequeue(), Some((1, "first again")));
/// assert_eq!(queue.dequeue(), Some((2, "second")));
/// assert_eq!(queue.dequeue(), None);
/// ```
pub struct DedupQueue<K, V> {
    // Each slot remembers the stamp the key had when it was enqueued. A slot whose stamp no
    // longer matches the live entry is stale.
    order: VecDeque<(u64, K)>,
    entries: HashMap<K, Slot<V>, RandomState>,
    next_stamp: u64,
}

struct Slot<V> {
    stamp: u64,
    value: V,
}

impl<K, V> DedupQueue<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::default(),
            next_stamp: 0,
        }
    }

    /// Number of entries in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry with the given key is in the queue.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Adds an entry at the back of the queue.
    ///
    /// If the key is already present, the stored value is replaced and the previous value is
    /// returned. The entry keeps its existing position in the queue.
    pub fn enqueue(&mut self, key: K, value: V) -> Option<V> {
        if let Some(slot) = self.entries.get_mut(&key) {
            return Some(mem::replace(&mut slot.value, value));
        }

        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);

        self.order.push_back((stamp, key.clone()));
        self.entries.insert(key, Slot { stamp, value });

        None
    }

    /// Removes and returns the oldest entry, or `None` if the queue is empty.
    pub fn dequeue(&mut self) -> Option<(K, V)> {
        while let Some((stamp, key)) = self.order.pop_front() {
            let is_current = self
                .entries
                .get(&key)
                .is_some_and(|slot| slot.stamp == stamp);

            if is_current {
                let slot = self.entries.remove(&key)?;
                return Some((key, slot.value));
            }
        }

        None
    }

    /// Removes the entry with the given key, wherever it is in the queue.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.compact_if_sparse();
        Some(slot.value)
    }

    /// Removes every entry, yielding them oldest first.
    ///
    /// Entries not consumed from the iterator stay in the queue.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        iter::from_fn(|| self.dequeue())
    }

    /// Removes every entry without yielding them.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    fn compact_if_sparse(&mut self) {
        if self.order.len() < COMPACT_THRESHOLD {
            return;
        }

        if self.order.len() < self.entries.len().saturating_mul(2) {
            return;
        }

        let entries = &self.entries;
        self.order.retain(|(stamp, key)| {
            entries
                .get(key)
                .is_some_and(|slot| slot.stamp == *stamp)
        });
    }

    #[cfg(test)]
    fn order_slots(&self) -> usize {
        self.order.len()
    }
}

impl<K, V> Default for DedupQueue<K, V>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for DedupQueue<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupQueue")
            .field("len", &self.entries.len())
            .field("order_slots", &self.order.len())
            .finish_non_exhaustive()
    }
}
