//! Concurrent map shared by the workers of one pipeline stage.
//!
//! A single reader/writer lock guards a plain `HashMap`. Values are meant to
//! be cheap handles (`Arc`s) so that callers never hold the map lock while
//! working on an entry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

pub struct ConcurrentMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    /// Return the value for `key`, inserting `make()` first if absent.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(v) = self.get(&key) {
            return v;
        }
        self.inner.write().entry(key).or_insert_with(make).clone()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write().insert(key, value)
    }

    /// Remove `key` only if its current value satisfies `pred`.
    ///
    /// Used to delete a specific entry without clobbering a newer entry that
    /// another worker inserted under the same key.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut map = self.inner.write();
        match map.get(key) {
            Some(v) if pred(v) => map.remove(key),
            _ => None,
        }
    }

    /// Snapshot of the current keys; the lock is released before returning.
    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_or_insert_keeps_first_value() {
        let map: ConcurrentMap<&str, Arc<u32>> = ConcurrentMap::new();
        let first = map.get_or_insert_with("a", || Arc::new(1));
        let second = map.get_or_insert_with("a", || Arc::new(2));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_if_respects_identity() {
        let map: ConcurrentMap<u8, Arc<u32>> = ConcurrentMap::new();
        let old = Arc::new(1);
        map.insert(7, Arc::clone(&old));
        let newer = Arc::new(2);
        map.insert(7, Arc::clone(&newer));

        assert!(map.remove_if(&7, |v| Arc::ptr_eq(v, &old)).is_none());
        assert_eq!(map.len(), 1);
        assert!(map.remove_if(&7, |v| Arc::ptr_eq(v, &newer)).is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        let map: Arc<ConcurrentMap<u32, u32>> = Arc::new(ConcurrentMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.get_or_insert_with(i, || t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 100);
        assert_eq!(map.keys().len(), 100);
    }
}
