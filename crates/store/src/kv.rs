//! Durable key-value interface shared by the state store and config store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;

/// Minimal get/put/list surface over a durable key-value backend.
///
/// Implementations must be `Send + Sync + 'static` so they can be shared
/// across request handlers and detached background tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetch the raw value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value. A `ttl` of
    /// `None` keeps the entry until it is overwritten.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Store `value` only if `key` is absent. Returns `true` when this call
    /// created the entry. Must be atomic with respect to concurrent callers.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError>;

    /// List keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;
