use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// A value that can be reset to an empty state while keeping its allocated capacity.
///
/// [`CollectionPool`] recycles every value it takes back, so a rented value never carries
/// content from its previous user.
///
/// [`CollectionPool`]: crate::CollectionPool
pub trait Recycle {
    /// Removes all content, keeping allocated capacity where the type allows it.
    fn recycle(&mut self);
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<T> Recycle for VecDeque<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<K, V, S> Recycle for HashMap<K, V, S> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<T, S> Recycle for HashSet<T, S> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<K, V> Recycle for BTreeMap<K, V> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<T> Recycle for BTreeSet<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recycle for String {
    fn recycle(&mut self) {
        self.clear();
    }
}
