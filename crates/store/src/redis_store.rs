//! Redis-backed `KeyValueStore` used for both transaction state and site config.

use async_trait::async_trait;
use funnel_core::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

use crate::error::StoreError;
use crate::kv::KeyValueStore;

/// Redis store over an auto-reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the first configured Redis node.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::ConnectTimeout(config.connect_timeout_ms))??;

        // Verify connectivity
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self { conn })
    }
}

/// Redis rejects `EX 0`; round sub-second expiries up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        metrics::counter!("store.reads").increment(1);
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        metrics::counter!("store.writes").increment(1);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        metrics::counter!("store.writes").increment(1);
        Ok(reply.is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(scan_pattern(prefix)).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
