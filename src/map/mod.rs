use core::hash::Hasher;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;

pub(crate) mod base;
mod box_map;
mod int_map;
mod locked_map;
mod ref_map;
mod registry;


pub use base::{Claim, KeyProbe, KeySpace, Snapshot, Table};
pub use box_map::*;
pub use int_map::*;
pub use locked_map::*;
pub use ref_map::*;
pub use registry::*;

/// The shared contract of every map variant in this crate. The lock-free
/// tables and the mutex-wrapped table implement the same surface, so callers
/// pick the implementation by configuration rather than by API.
pub trait Map<K, V: Clone> {
    /// Capacity is rounded up to a power of two; zero gets the minimum table.
    fn with_capacity(cap: usize) -> Self;
    fn get(&self, key: &K) -> Option<V>;
    /// Upsert. Returns the value that was replaced, if any.
    fn insert(&self, key: &K, value: &V) -> Option<V>;
    /// Add-if-absent. `None` means the value was added; `Some` carries the
    /// incumbent value and signals a duplicate key.
    fn try_insert(&self, key: &K, value: &V) -> Option<V>;
    fn remove(&self, key: &K) -> Option<V>;
    /// Point-in-time enumeration, weakly consistent under concurrency.
    fn entries(&self) -> Vec<(K, V)>;
    fn contains_key(&self, key: &K) -> bool;
    /// Exact count; reads every counter cell.
    fn len(&self) -> usize;
    /// Cached count refreshed once per clock tick; cheap but stale.
    fn estimated_len(&self) -> usize;
    fn clear(&self);
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    // The factory may run more than once under contention; only one result is
    // ever published, the others are discarded.
    fn get_or_insert<F: Fn() -> V>(&self, key: &K, func: F) -> V {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = func();
        match self.try_insert(key, &value) {
            Some(existing) => existing,
            None => value,
        }
    }
}

#[inline(always)]
pub fn hash_key<K: Hash + ?Sized, H: Hasher + Default>(key: &K) -> usize {
    let mut hasher = H::default();
    key.hash(&mut hasher);
    hasher.finish() as usize
}
