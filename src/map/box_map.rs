use super::base::*;
use super::*;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::marker::PhantomData;
use std::sync::atomic::Ordering::*;

// The fallback layout for arbitrary key types: each claimed cell owns a
// heap box carrying the key and its hash. Collisions compare the cached hash
// before touching key equality.
pub struct BoxedKey<K> {
    hash: usize,
    key: K,
}

pub struct BoxedCells<K, H: Hasher + Default> {
    _marker: PhantomData<(K, H)>,
}

impl<K, H: Hasher + Default> BoxedCells<K, H> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, H> KeySpace<K> for BoxedCells<K, H>
where
    K: Clone + Hash + Eq + Send + Sync,
    H: Hasher + Default + Send + Sync,
{
    type Cell = Atomic<BoxedKey<K>>;

    #[inline(always)]
    fn empty_cell(&self) -> Self::Cell {
        Atomic::null()
    }

    #[inline(always)]
    fn hash_of(&self, key: &K) -> usize {
        hash_key::<_, H>(key)
    }

    fn probe(&self, cell: &Self::Cell, key: &K, hash: usize, guard: &Guard) -> KeyProbe {
        let stored = cell.load(Acquire, guard);
        match unsafe { stored.as_ref() } {
            None => KeyProbe::Empty,
            Some(boxed) if boxed.hash == hash && boxed.key == *key => KeyProbe::Match,
            Some(_) => KeyProbe::Other,
        }
    }

    fn try_claim_for_put(&self, cell: &Self::Cell, key: &K, hash: usize, guard: &Guard) -> Claim {
        let stored = cell.load(Acquire, guard);
        if stored.is_null() {
            let fresh = Owned::new(BoxedKey {
                hash,
                key: key.clone(),
            });
            match cell.compare_exchange(Shared::null(), fresh, AcqRel, Acquire, guard) {
                Ok(_) => return Claim::Claimed,
                Err(e) => {
                    // Losers observe the winner's key and compare against it.
                    drop(e.new);
                    let winner = unsafe { e.current.deref() };
                    return if winner.hash == hash && winner.key == *key {
                        Claim::Held
                    } else {
                        Claim::Collision
                    };
                }
            }
        }
        let stored = unsafe { stored.deref() };
        if stored.hash == hash && stored.key == *key {
            Claim::Held
        } else {
            Claim::Collision
        }
    }

    fn try_claim_for_copy(&self, cell: &Self::Cell, key: &K, hash: usize, guard: &Guard) -> Claim {
        self.try_claim_for_put(cell, key, hash, guard)
    }

    fn read_key(&self, cell: &Self::Cell, guard: &Guard) -> Option<K> {
        let stored = cell.load(Acquire, guard);
        unsafe { stored.as_ref() }.map(|boxed| boxed.key.clone())
    }

    unsafe fn release_cell(cell: &Self::Cell) {
        let stored = cell.load(Relaxed, crossbeam_epoch::unprotected());
        if !stored.is_null() {
            drop(stored.into_owned());
        }
    }
}

/// Lock-free map for arbitrary hashable keys.
pub struct BoxMap<K, V, H = DefaultHasher>
where
    K: Clone + Hash + Eq + Send + Sync,
    V: Clone,
    H: Hasher + Default + Send + Sync,
{
    table: Table<K, V, BoxedCells<K, H>>,
}

impl<K, V, H> BoxMap<K, V, H>
where
    K: Clone + Hash + Eq + Send + Sync,
    V: Clone,
    H: Hasher + Default + Send + Sync,
{
    pub fn try_update(&self, key: &K, new: &V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.table.try_update(key, new, expected)
    }

    pub fn upsert(&self, key: &K, value: &V) -> bool {
        self.table.upsert(key, value)
    }

    pub fn insert_or_update<F: Fn(&V) -> V>(&self, key: &K, add: &V, update: F) -> V
    where
        V: PartialEq,
    {
        self.table.insert_or_update(key, add, update)
    }

    pub fn iter(&self) -> Snapshot<'_, K, V, BoxedCells<K, H>> {
        self.table.snapshot()
    }
}

impl<K, V, H> Map<K, V> for BoxMap<K, V, H>
where
    K: Clone + Hash + Eq + Send + Sync,
    V: Clone,
    H: Hasher + Default + Send + Sync,
{
    fn with_capacity(cap: usize) -> Self {
        Self {
            table: Table::with_capacity(cap, BoxedCells::new()),
        }
    }

    #[inline(always)]
    fn get(&self, key: &K) -> Option<V> {
        self.table.get(key)
    }

    #[inline(always)]
    fn insert(&self, key: &K, value: &V) -> Option<V> {
        self.table.insert(key, value)
    }

    #[inline(always)]
    fn try_insert(&self, key: &K, value: &V) -> Option<V> {
        self.table.try_insert(key, value)
    }

    #[inline(always)]
    fn remove(&self, key: &K) -> Option<V> {
        self.table.remove(key)
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.iter().collect()
    }

    #[inline(always)]
    fn contains_key(&self, key: &K) -> bool {
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
    use crate::map::tests::Obj;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn obj_map() {
        let _ = env_logger::try_init();
        let map = BoxMap::<usize, Obj>::with_capacity(16);
        for i in 5..2048 {
            map.insert(&i, &Obj::new(i));
        }
        for i in 5..2048 {
            match map.get(&i) {
                Some(r) => r.validate(i),
                None => panic!("{}", i),
            }
        }
    }

    #[test]
    fn string_keys_resize() {
        let _ = env_logger::try_init();
        let map = BoxMap::<String, usize>::with_capacity(4);
        for i in 0..512 {
            map.insert(&format!("key-{}", i), &i);
        }
        for i in 0..512 {
            assert_eq!(map.get(&format!("key-{}", i)), Some(i));
        }
        assert_eq!(map.len(), 512);
    }

    #[test]
    fn try_insert_reports_duplicates() {
        let map = BoxMap::<String, usize>::with_capacity(8);
        assert_eq!(map.try_insert(&"a".to_string(), &1), None);
        assert_eq!(map.try_insert(&"a".to_string(), &2), Some(1));
        assert_eq!(map.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn one_try_insert_winner_per_key() {
        let _ = env_logger::try_init();
        let map = Arc::new(BoxMap::<String, usize>::with_capacity(8));
        let num_threads = 32;
        let mut threads = vec![];
        for i in 0..num_threads {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                map.try_insert(&"contended".to_string(), &i).is_none()
            }));
        }
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn get_or_insert_publishes_one_object() {
        let _ = env_logger::try_init();
        let map = Arc::new(BoxMap::<String, Arc<Obj>>::with_capacity(8));
        let num_threads = 50;
        let mut threads = vec![];
        for _ in 0..num_threads {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                // The factory allocates a fresh object per call; only one of
                // them may ever be published.
                map.get_or_insert(&"x".to_string(), || Arc::new(Obj::new(1)))
            }));
        }
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        let first = &results[0];
        for r in &results[1..] {
            assert!(Arc::ptr_eq(first, r));
        }
    }

    #[test]
    fn insert_or_update_converges() {
        let _ = env_logger::try_init();
        let map = Arc::new(BoxMap::<String, usize>::with_capacity(8));
        let num_threads = 16;
        let per_thread = 500;
        let mut threads = vec![];
        for _ in 0..num_threads {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..per_thread {
                    map.insert_or_update(&"acc".to_string(), &1, |v| v + 1);
                }
            }));
        }
        for t in threads {
            let _ = t.join();
        }
        assert_eq!(map.get(&"acc".to_string()), Some(num_threads * per_thread));
    }
}
