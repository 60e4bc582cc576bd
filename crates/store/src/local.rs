//! In-process TTL cache backed by DashMap for lock-free concurrent access.
//! Sits in front of the config store to cut round trips; never the source of truth.

use dashmap::DashMap;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Process-local cache with per-entry expiry. Negative results are cached by
/// choosing a `V` that can represent absence (`Option<T>`, an empty `Vec`).
pub struct TtlCache<V> {
    store: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Get a value, returns None if expired or missing. A zero TTL disables caching.
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or update an entry.
    pub fn put(&self, key: String, value: V) {
        // Over capacity: skip new keys until the periodic sweep frees room
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_negative_entry() {
        let cache: TtlCache<Option<String>> = TtlCache::new(Duration::from_secs(60), 10);
        cache.put("present".into(), Some("v".into()));
        cache.put("absent".into(), None);

        assert_eq!(cache.get("present"), Some(Some("v".to_string())));
        assert_eq!(cache.get("absent"), Some(None));
        assert_eq!(cache.get("unknown"), None);
    }

    #[test]
    fn test_zero_ttl_never_serves() {
        let cache: TtlCache<Vec<String>> = TtlCache::new(Duration::ZERO, 10);
        cache.put("k".into(), vec!["a".into()]);
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_and_eviction() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO, 2);
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        cache.put("c".into(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evict_expired(), 2);
        assert!(cache.is_empty());
    }
}
