//! In-memory `KeyValueStore` for single-node development and tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::kv::KeyValueStore;

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// DashMap-backed store honoring per-key expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired keys. Expired keys are also hidden lazily on read.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired());
        before - self.entries.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.put("k", "v1", None).await.unwrap();
        store.put("k", "v2", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_hidden() {
        let store = MemoryStore::new();
        store.put("gone", "v", Some(Duration::ZERO)).await.unwrap();
        store.put("kept", "v", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert_eq!(store.list("").await.unwrap(), vec!["kept".to_string()]);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_put_if_absent_single_winner() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("claim", "1", None).await.unwrap());
        assert!(!store.put_if_absent("claim", "2", None).await.unwrap());
        assert_eq!(store.get("claim").await.unwrap().as_deref(), Some("1"));

        store.put("stale", "x", Some(Duration::ZERO)).await.unwrap();
        assert!(store.put_if_absent("stale", "y", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_prefix_sorted() {
        let store = MemoryStore::new();
        for key in ["s1_b", "s1_a", "s2_a"] {
            store.put(key, "v", None).await.unwrap();
        }
        assert_eq!(store.list("s1_").await.unwrap(), vec!["s1_a", "s1_b"]);
    }
}
