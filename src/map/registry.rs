use super::box_map::BoxMap;
use super::*;
use ahash::AHasher;
use std::any::TypeId;

/// String-keyed table with the crate's fixed hasher. The scan pipeline keys
/// pending lookups by rendered row/column coordinates, which arrive here as
/// plain strings.
pub type StringMap<V> = BoxMap<String, V, AHasher>;

/// Per-type memoization cache with an explicit lifecycle: construct one per
/// inspector and thread it through the call graph instead of hanging state
/// off a process-wide singleton. Independent registries never share entries,
/// which keeps tests isolated.
pub struct TypeRegistry<V: Clone + Send + Sync> {
    table: BoxMap<TypeId, V, AHasher>,
}

impl<V: Clone + Send + Sync> TypeRegistry<V> {
    pub fn new() -> Self {
        Self::with_capacity(32)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            table: BoxMap::with_capacity(cap),
        }
    }

    pub fn get<T: 'static>(&self) -> Option<V> {
        self.table.get(&TypeId::of::<T>())
    }

    // The factory may run more than once under contention; only one result
    // is ever published per type.
    pub fn get_or_insert_with<T: 'static, F: Fn() -> V>(&self, func: F) -> V {
        self.table.get_or_insert(&TypeId::of::<T>(), func)
    }

    pub fn insert<T: 'static>(&self, value: &V) -> Option<V> {
        self.table.insert(&TypeId::of::<T>(), value)
    }

    pub fn remove<T: 'static>(&self) -> Option<V> {
        self.table.remove(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + Sync> Default for TypeRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;
    use std::thread;

    struct RowMeta;
    struct ColumnMeta;

    #[test]
    fn string_map_fixed_hasher() {
        let map = StringMap::<usize>::with_capacity(8);
        for i in 0..64 {
            map.insert(&format!("row:{}/col:{}", i, i * 2), &i);
        }
        for i in 0..64 {
            assert_eq!(map.get(&format!("row:{}/col:{}", i, i * 2)), Some(i));
        }
    }

    #[test]
    fn registry_memoizes_per_type() {
        let registry = TypeRegistry::<Arc<String>>::new();
        let built = Arc::new(AtomicUsize::new(0));
        let make = {
            let built = built.clone();
            move || {
                built.fetch_add(1, Relaxed);
                Arc::new("row-meta".to_string())
            }
        };
        let first = registry.get_or_insert_with::<RowMeta, _>(&make);
        let second = registry.get_or_insert_with::<RowMeta, _>(&make);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Relaxed), 1);
        assert_eq!(registry.get::<ColumnMeta>(), None);
        registry.get_or_insert_with::<ColumnMeta, _>(|| Arc::new("col-meta".to_string()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registries_are_independent() {
        let a = TypeRegistry::<usize>::new();
        let b = TypeRegistry::<usize>::new();
        a.insert::<RowMeta>(&1);
        assert_eq!(a.get::<RowMeta>(), Some(1));
        assert_eq!(b.get::<RowMeta>(), None);
    }

    #[test]
    fn concurrent_memoization_shares_one_value() {
        let registry = Arc::new(TypeRegistry::<Arc<String>>::new());
        let mut threads = vec![];
        for _ in 0..16 {
            let registry = registry.clone();
            threads.push(thread::spawn(move || {
                registry.get_or_insert_with::<RowMeta, _>(|| Arc::new("meta".to_string()))
            }));
        }
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
    }
}
