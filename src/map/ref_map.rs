use super::base::*;
use super::*;
use crossbeam_epoch::Guard;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::*;
use std::sync::Arc;

// Reference keys skip the per-key box: the cell holds the raw pointer of a
// shared `Arc<K>` and the claim is a CAS on that pointer. Collisions resolve
// by pointer identity first, then by key equality.
pub struct RefCells<K, H: Hasher + Default> {
    _marker: PhantomData<(Arc<K>, H)>,
}

impl<K, H: Hasher + Default> RefCells<K, H> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, H> KeySpace<Arc<K>> for RefCells<K, H>
where
    K: Hash + Eq + Send + Sync,
    H: Hasher + Default + Send + Sync,
{
    type Cell = AtomicPtr<K>;

    #[inline(always)]
    fn empty_cell(&self) -> Self::Cell {
        AtomicPtr::new(ptr::null_mut())
    }

    #[inline(always)]
    fn hash_of(&self, key: &Arc<K>) -> usize {
        hash_key::<_, H>(&**key)
    }

    fn probe(&self, cell: &Self::Cell, key: &Arc<K>, _hash: usize, _guard: &Guard) -> KeyProbe {
        let stored = cell.load(Acquire);
        if stored.is_null() {
            KeyProbe::Empty
        } else if ptr::eq(stored, Arc::as_ptr(key)) || unsafe { &*stored } == &**key {
            KeyProbe::Match
        } else {
            KeyProbe::Other
        }
    }

    fn try_claim_for_put(
        &self,
        cell: &Self::Cell,
        key: &Arc<K>,
        _hash: usize,
        _guard: &Guard,
    ) -> Claim {
        let raw = Arc::into_raw(key.clone()) as *mut K;
        match cell.compare_exchange(ptr::null_mut(), raw, AcqRel, Acquire) {
            Ok(_) => Claim::Claimed,
            Err(winner) => {
                unsafe { drop(Arc::from_raw(raw)) };
                if ptr::eq(winner, Arc::as_ptr(key)) || unsafe { &*winner } == &**key {
                    Claim::Held
                } else {
                    Claim::Collision
                }
            }
        }
    }

    fn try_claim_for_copy(
        &self,
        cell: &Self::Cell,
        key: &Arc<K>,
        hash: usize,
        guard: &Guard,
    ) -> Claim {
        self.try_claim_for_put(cell, key, hash, guard)
    }

    fn read_key(&self, cell: &Self::Cell, _guard: &Guard) -> Option<Arc<K>> {
        let stored = cell.load(Acquire);
        if stored.is_null() {
            None
        } else {
            unsafe {
                Arc::increment_strong_count(stored);
                Some(Arc::from_raw(stored))
            }
        }
    }

    unsafe fn release_cell(cell: &Self::Cell) {
        let stored = cell.load(Relaxed);
        if !stored.is_null() {
            drop(Arc::from_raw(stored));
        }
    }
}

/// Lock-free map keyed by shared references. The key cell stores the `Arc`'s
/// pointer directly, so claiming a slot never allocates.
pub struct RefMap<K, V, H = DefaultHasher>
where
    K: Hash + Eq + Send + Sync,
    V: Clone,
    H: Hasher + Default + Send + Sync,
{
    table: Table<Arc<K>, V, RefCells<K, H>>,
}

impl<K, V, H> RefMap<K, V, H>
where
    K: Hash + Eq + Send + Sync,
    V: Clone,
    H: Hasher + Default + Send + Sync,
{
    pub fn try_update(&self, key: &Arc<K>, new: &V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.table.try_update(key, new, expected)
    }

    pub fn upsert(&self, key: &Arc<K>, value: &V) -> bool {
        self.table.upsert(key, value)
    }

    pub fn insert_or_update<F: Fn(&V) -> V>(&self, key: &Arc<K>, add: &V, update: F) -> V
    where
        V: PartialEq,
    {
        self.table.insert_or_update(key, add, update)
    }

    pub fn iter(&self) -> Snapshot<'_, Arc<K>, V, RefCells<K, H>> {
        self.table.snapshot()
    }
}

impl<K, V, H> Map<Arc<K>, V> for RefMap<K, V, H>
where
    K: Hash + Eq + Send + Sync,
    V: Clone,
    H: Hasher + Default + Send + Sync,
{
    fn with_capacity(cap: usize) -> Self {
        Self {
            table: Table::with_capacity(cap, RefCells::new()),
        }
    }

    #[inline(always)]
    fn get(&self, key: &Arc<K>) -> Option<V> {
        self.table.get(key)
    }

    #[inline(always)]
    fn insert(&self, key: &Arc<K>, value: &V) -> Option<V> {
        self.table.insert(key, value)
    }

    #[inline(always)]
    fn try_insert(&self, key: &Arc<K>, value: &V) -> Option<V> {
        self.table.try_insert(key, value)
    }

    #[inline(always)]
    fn remove(&self, key: &Arc<K>) -> Option<V> {
        self.table.remove(key)
    }

    fn entries(&self) -> Vec<(Arc<K>, V)> {
        self.iter().collect()
    }

    #[inline(always)]
    fn contains_key(&self, key: &Arc<K>) -> bool {
        self.get(key).is_some()
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.table.len()
    }

    #[inline(always)]
    fn estimated_len(&self) -> usize {
        self.table.estimated_len()
    }

    fn clear(&self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn ref_keys_roundtrip() {
        let _ = env_logger::try_init();
        let map = RefMap::<String, usize>::with_capacity(16);
        let key = Arc::new("alpha".to_string());
        assert_eq!(map.try_insert(&key, &1), None);
        // A different allocation of an equal key still matches.
        let same = Arc::new("alpha".to_string());
        assert_eq!(map.get(&same), Some(1));
        assert_eq!(map.insert(&same, &2), Some(1));
        assert_eq!(map.remove(&key), Some(2));
        assert_eq!(map.get(&key), None);
    }

    #[test]
    fn resize_keeps_shared_keys() {
        let _ = env_logger::try_init();
        let map = RefMap::<u64, u64>::with_capacity(2);
        let keys: Vec<_> = (0..256u64).map(Arc::new).collect();
        for key in &keys {
            map.insert(key, &(**key * 3));
        }
        for key in &keys {
            assert_eq!(map.get(key), Some(**key * 3));
        }
        // Slot claims and copies only bump refcounts, they never rehash the
        // allocation away.
        assert!(Arc::strong_count(&keys[0]) >= 2);
    }

    #[test]
    fn parallel_ref_inserts() {
        let _ = env_logger::try_init();
        let map = Arc::new(RefMap::<u64, u64>::with_capacity(4));
        let mut threads = vec![];
        for t in 0..8u64 {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                for i in 0..500u64 {
                    let key = Arc::new(t * 1000 + i);
                    map.insert(&key, &i);
                }
            }));
        }
        for t in threads {
            let _ = t.join();
        }
        assert_eq!(map.len(), 8 * 500);
    }
}
