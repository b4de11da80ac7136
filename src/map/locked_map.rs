use super::*;
use parking_lot::Mutex;
use std::collections::HashMap as StdHashMap;

/// The deliberately simple alternative to the lock-free tables: one coarse
/// mutex scoped to the whole structure. Same `Map` contract, so callers can
/// select it by configuration where predictable simplicity matters more than
/// scaling under write contention.
pub struct LockedMap<K: Clone + Hash + Eq, V: Clone> {
    inner: Mutex<StdHashMap<K, V>>,
}

impl<K: Clone + Hash + Eq, V: Clone> LockedMap<K, V> {
    pub fn try_update(&self, key: &K, new: &V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(current) if current == expected => {
                *current = new.clone();
                true
            }
            _ => false,
        }
    }

    pub fn upsert(&self, key: &K, value: &V) -> bool {
        self.inner.lock().insert(key.clone(), value.clone()).is_none()
    }

    pub fn insert_or_update<F: Fn(&V) -> V>(&self, key: &K, add: &V, update: F) -> V {
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(current) => {
                let new = update(current);
                *current = new.clone();
                new
            }
            None => {
                inner.insert(key.clone(), add.clone());
                add.clone()
            }
        }
    }

    pub fn iter(&self) -> std::vec::IntoIter<(K, V)> {
        self.entries().into_iter()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> Map<K, V> for LockedMap<K, V> {
    fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(StdHashMap::with_capacity(cap)),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    fn insert(&self, key: &K, value: &V) -> Option<V> {
        self.inner.lock().insert(key.clone(), value.clone())
    }

    fn try_insert(&self, key: &K, value: &V) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(existing) => Some(existing.clone()),
            None => {
                inner.insert(key.clone(), value.clone());
                None
            }
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn estimated_len(&self) -> usize {
        self.len()
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // The locked table must be interchangeable with the lock-free ones.
    fn exercise<M: Map<u64, u64>>(map: &M) {
        assert_eq!(map.try_insert(&1, &10), None);
        assert_eq!(map.try_insert(&1, &11), Some(10));
        assert_eq!(map.insert(&1, &12), Some(10));
        assert_eq!(map.get(&1), Some(12));
        assert_eq!(map.remove(&1), Some(12));
        assert_eq!(map.remove(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn contract_parity() {
        exercise(&LockedMap::<u64, u64>::with_capacity(8));
        exercise(&super::super::IntMap::<u64, u64>::with_capacity(8));
        exercise(&super::super::BoxMap::<u64, u64>::with_capacity(8));
    }

    #[test]
    fn coarse_lock_under_threads() {
        let map = Arc::new(LockedMap::<u64, u64>::with_capacity(64));
        let mut threads = vec![];
        for t in 0..8u64 {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                for i in 0..500u64 {
                    map.insert(&(t * 1000 + i), &i);
                }
            }));
        }
        for t in threads {
            let _ = t.join();
        }
        assert_eq!(map.len(), 8 * 500);
    }
}
