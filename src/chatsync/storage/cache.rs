use std::num::NonZeroUsize;

use parking_lot::Mutex;

/// Bounded least-recently-used cache keyed by storage key.
///
/// `get` and `put` both promote recency; a `put` beyond capacity evicts the
/// least-recently-used entry. The lock is never held across an await point.
pub struct LruCache<V> {
    name: &'static str,
    entries: Mutex<lru::LruCache<String, V>>,
}

impl<V: Clone> LruCache<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    /// Inserts or replaces `key`, returning the key evicted to make room, if any.
    pub fn put(&self, key: impl Into<String>, value: V) -> Option<String> {
        let key = key.into();
        let evicted = self.entries.lock().push(key.clone(), value);
        match evicted {
            Some((evicted_key, _)) if evicted_key != key => {
                tracing::trace!(
                    target: "chatsync::storage::cache",
                    "Cache {} evicted {}",
                    self.name,
                    evicted_key
                );
                Some(evicted_key)
            }
            _ => None,
        }
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.entries.lock().pop(key)
    }

    /// Membership check that does not touch recency.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl<V> std::fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("LruCache")
            .field("name", &self.name)
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_beyond_capacity_evicts_least_recently_used() {
        let cache = LruCache::new("test", 3);
        assert_eq!(cache.put("a", 1), None);
        assert_eq!(cache.put("b", 2), None);
        assert_eq!(cache.put("c", 3), None);

        assert_eq!(cache.put("d", 4), Some("a".to_string()));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_get_hit_refreshes_recency() {
        let cache = LruCache::new("test", 3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        assert_eq!(cache.get("a"), Some(1));

        assert_eq!(cache.put("d", 4), Some("b".to_string()));
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_put_existing_key_replaces_without_eviction() {
        let cache = LruCache::new("test", 2);
        cache.put("a", 1);
        cache.put("b", 2);

        assert_eq!(cache.put("a", 10), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));

        // "a" was promoted by the replacing put
        assert_eq!(cache.put("c", 3), Some("b".to_string()));
    }

    #[test]
    fn test_delete_and_zero_capacity() {
        let cache = LruCache::new("test", 0);
        assert_eq!(cache.capacity(), 1);

        cache.put("a", 1);
        assert_eq!(cache.delete("a"), Some(1));
        assert_eq!(cache.delete("a"), None);
        assert!(cache.is_empty());
    }
}
