use super::base::*;
use super::*;
use crossbeam_epoch::Guard;
use std::marker::PhantomData;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::*;

/// Raw integer keys stored inline in one atomic word, no allocation per key.
///
/// Zero marks an empty cell, so keys are stored bitwise-complemented: the
/// common zero key then occupies a non-zero encoding and never needs the
/// empty representation. The complement of zero itself (`u64::MAX` and
/// friends) becomes the one reserved key; storing it is rejected in debug
/// builds and unsupported in release builds.
pub trait IntKey: Copy + Eq + Hash + Send + Sync + 'static {
    fn to_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

impl IntKey for u64 {
    #[inline(always)]
    fn to_word(self) -> u64 {
        self
    }
    #[inline(always)]
    fn from_word(word: u64) -> Self {
        word
    }
}

impl IntKey for u32 {
    #[inline(always)]
    fn to_word(self) -> u64 {
        self as u64
    }
    #[inline(always)]
    fn from_word(word: u64) -> Self {
        word as u32
    }
}

impl IntKey for usize {
    #[inline(always)]
    fn to_word(self) -> u64 {
        self as u64
    }
    #[inline(always)]
    fn from_word(word: u64) -> Self {
        word as usize
    }
}

#[inline(always)]
fn encode<K: IntKey>(key: K) -> u64 {
    let encoded = !key.to_word();
    debug_assert_ne!(encoded, 0, "the all-ones key is reserved");
    encoded
}

#[inline(always)]
fn decode<K: IntKey>(encoded: u64) -> K {
    K::from_word(!encoded)
}

pub struct IntCells<K: IntKey, H: Hasher + Default> {
    _marker: PhantomData<(K, H)>,
}

impl<K: IntKey, H: Hasher + Default> IntCells<K, H> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K: IntKey, H: Hasher + Default + Send + Sync> KeySpace<K> for IntCells<K, H> {
    type Cell = AtomicU64;

    #[inline(always)]
    fn empty_cell(&self) -> AtomicU64 {
        AtomicU64::new(0)
    }

    #[inline(always)]
    fn hash_of(&self, key: &K) -> usize {
        hash_key::<_, H>(key)
    }

    #[inline(always)]
    fn probe(&self, cell: &AtomicU64, key: &K, _hash: usize, _guard: &Guard) -> KeyProbe {
        let stored = cell.load(Acquire);
        if stored == 0 {
            KeyProbe::Empty
        } else if stored == encode(*key) {
            KeyProbe::Match
        } else {
            KeyProbe::Other
        }
    }

    #[inline(always)]
    fn try_claim_for_put(&self, cell: &AtomicU64, key: &K, _hash: usize, _guard: &Guard) -> Claim {
        let encoded = encode(*key);
        match cell.compare_exchange(0, encoded, AcqRel, Acquire) {
            Ok(_) => Claim::Claimed,
            Err(winner) if winner == encoded => Claim::Held,
            Err(_) => Claim::Collision,
        }
    }

    #[inline(always)]
    fn try_claim_for_copy(&self, cell: &AtomicU64, key: &K, hash: usize, guard: &Guard) -> Claim {
        self.try_claim_for_put(cell, key, hash, guard)
    }

    #[inline(always)]
    fn read_key(&self, cell: &AtomicU64, _guard: &Guard) -> Option<K> {
        let stored = cell.load(Acquire);
        if stored == 0 {
            None
        } else {
            Some(decode(stored))
        }
    }

    unsafe fn release_cell(_cell: &AtomicU64) {}
}

/// Lock-free map for raw integer keys, 32 or 64 bit.
pub struct IntMap<K: IntKey, V: Clone, H: Hasher + Default + Send + Sync = DefaultHasher> {
    table: Table<K, V, IntCells<K, H>>,
}

impl<K: IntKey, V: Clone, H: Hasher + Default + Send + Sync> IntMap<K, V, H> {
    /// Compare-and-swap update: installs `new` only while the current value
    /// equals `expected`.
    pub fn try_update(&self, key: &K, new: &V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.table.try_update(key, new, expected)
    }

    /// Upsert that reports whether the key was newly added.
    pub fn upsert(&self, key: &K, value: &V) -> bool {
        self.table.upsert(key, value)
    }

    pub fn insert_or_update<F: Fn(&V) -> V>(&self, key: &K, add: &V, update: F) -> V
    where
        V: PartialEq,
    {
        self.table.insert_or_update(key, add, update)
    }

    pub fn iter(&self) -> Snapshot<'_, K, V, IntCells<K, H>> {
        self.table.snapshot()
    }
}

impl<K: IntKey, V: Clone, H: Hasher + Default + Send + Sync> Map<K, V> for IntMap<K, V, H> {
    fn with_capacity(cap: usize) -> Self {
        Self {
            table: Table::with_capacity(cap, IntCells::new()),
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
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn will_not_overflow() {
        let _ = env_logger::try_init();
        let map = IntMap::<u64, u64>::with_capacity(16);
        for i in 50..60 {
            assert_eq!(map.insert(&i, &i), None);
        }
        for i in 50..60 {
            assert_eq!(map.get(&i), Some(i));
        }
        for i in 50..60 {
            assert_eq!(map.remove(&i), Some(i));
        }
    }

    #[test]
    fn zero_key_roundtrip() {
        let map = IntMap::<u64, u64>::with_capacity(8);
        assert_eq!(map.get(&0), None);
        assert_eq!(map.insert(&0, &7), None);
        assert_eq!(map.get(&0), Some(7));
        assert_eq!(map.insert(&0, &9), Some(7));
        assert_eq!(map.remove(&0), Some(9));
        assert_eq!(map.get(&0), None);
    }

    #[test]
    fn narrow_keys() {
        let map = IntMap::<u32, String>::with_capacity(8);
        map.insert(&0, &"zero".to_string());
        map.insert(&u32::MAX, &"ones".to_string());
        assert_eq!(map.get(&0).as_deref(), Some("zero"));
        assert_eq!(map.get(&u32::MAX).as_deref(), Some("ones"));
    }

    #[test]
    fn resize() {
        let _ = env_logger::try_init();
        let map = IntMap::<u64, u64>::with_capacity(16);
        for i in 5..2048 {
            map.insert(&i, &(i * 2));
        }
        for i in 5..2048 {
            match map.get(&i) {
                Some(r) => assert_eq!(r, i * 2),
                None => panic!("{}", i),
            }
        }
    }

    #[test]
    fn parallel_no_resize() {
        let _ = env_logger::try_init();
        let map = Arc::new(IntMap::<u64, u64>::with_capacity(65536));
        let mut threads = vec![];
        for i in 5..99u64 {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                for j in 5..60u64 {
                    map.insert(&(i * 100 + j), &(i * j));
                }
            }));
        }
        for i in 100..900u64 {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                for j in 5..60u64 {
                    map.insert(&(i * 100 + j), &(i * j));
                    map.remove(&(i * 100 + j));
                }
            }));
        }
        for t in threads {
            let _ = t.join();
        }
        for i in 5..99u64 {
            for j in 5..60u64 {
                assert_eq!(map.get(&(i * 100 + j)), Some(i * j));
            }
        }
        for i in 100..900u64 {
            for j in 5..60u64 {
                assert_eq!(map.get(&(i * 100 + j)), None);
            }
        }
    }

    #[test]
    fn parallel_with_resize() {
        let _ = env_logger::try_init();
        let num_threads = 8;
        let map = Arc::new(IntMap::<u64, u64>::with_capacity(4));
        let mut threads = vec![];
        for i in 0..num_threads {
            let map = map.clone();
            threads.push(thread::spawn(move || {
                for j in 0..1000u64 {
                    let key = i * 1000 + j + 1;
                    map.insert(&key, &(key * 10));
                }
            }));
        }
        for t in threads {
            let _ = t.join();
        }
        for key in 1..=num_threads * 1000 {
            match map.get(&key) {
                Some(v) => assert_eq!(v, key * 10, "key {}", key),
                None => panic!("missing key {}", key),
            }
        }
        assert_eq!(map.len(), num_threads as usize * 1000);
    }

    #[test]
    fn compare_and_swap_update() {
        let map = IntMap::<u64, u64>::with_capacity(16);
        map.insert(&1, &10);
        assert!(map.try_update(&1, &11, &10));
        assert!(!map.try_update(&1, &12, &10));
        assert_eq!(map.get(&1), Some(11));
        // Updating a missing key is a distinct non-event.
        assert!(!map.try_update(&2, &1, &1));
    }

    #[test]
    fn upsert_reports_insertion() {
        let map = IntMap::<u64, u64>::with_capacity(16);
        assert!(map.upsert(&5, &1));
        assert!(!map.upsert(&5, &2));
        assert_eq!(map.get(&5), Some(2));
    }
}
