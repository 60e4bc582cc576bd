//! Action catalog: which actions apply to a funnel step, and what each one does.
//! Reads the config store through a short-TTL process-local cache.

use funnel_core::error::{decode_stored, truncate_payload};
use funnel_core::keys;
use funnel_core::types::{ActionDefinition, FunnelStep};
use funnel_core::FunnelResult;
use funnel_store::{SharedStore, TtlCache};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Read-only view of configured actions. The cache only affects latency:
/// with a zero TTL every lookup goes to the store.
pub struct ActionCatalog {
    store: SharedStore,
    key_lists: TtlCache<Vec<String>>,
    definitions: TtlCache<Option<ActionDefinition>>,
}

impl ActionCatalog {
    pub fn new(store: SharedStore, cache_ttl: Duration, max_entries: usize) -> Self {
        Self {
            store,
            key_lists: TtlCache::new(cache_ttl, max_entries),
            definitions: TtlCache::new(cache_ttl, max_entries),
        }
    }

    /// Ordered action keys for `(site, step, affiliate, scrub status)`. A blank
    /// affiliate id fires nothing and never touches the store.
    pub async fn list_action_keys(
        &self,
        site_id: &str,
        step: FunnelStep,
        affiliate_id: &str,
        is_scrub: bool,
    ) -> Vec<String> {
        let affiliate = affiliate_id.trim().to_lowercase();
        if affiliate.is_empty() {
            debug!(site_id, step = %step, "No affiliate id, no actions apply");
            return Vec::new();
        }

        let key = keys::action_list_key(site_id, step, &affiliate, is_scrub);
        if let Some(cached) = self.key_lists.get(&key) {
            metrics::counter!("catalog.cache.hit").increment(1);
            return cached;
        }
        metrics::counter!("catalog.cache.miss").increment(1);

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(key = %key, error = %e, "Action list lookup failed");
                return Vec::new();
            }
        };

        let action_keys = match raw {
            None => {
                debug!(key = %key, "No actions configured");
                Vec::new()
            }
            Some(raw) => parse_key_list(&key, &raw),
        };
        self.key_lists.put(key, action_keys.clone());
        action_keys
    }

    /// Definition stored under `<siteId>_<actionKey>`; absent and malformed
    /// entries both yield `None` and are cached as such.
    pub async fn get_action_definition(&self, site_id: &str, action_key: &str) -> Option<ActionDefinition> {
        let key = keys::action_definition_key(site_id, action_key);
        if let Some(cached) = self.definitions.get(&key) {
            metrics::counter!("catalog.cache.hit").increment(1);
            return cached;
        }
        metrics::counter!("catalog.cache.miss").increment(1);

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(key = %key, error = %e, "Action definition lookup failed");
                return None;
            }
        };

        let definition = raw.and_then(|raw| match decode_stored::<ActionDefinition>(&key, &raw) {
            Ok(definition) => Some(definition),
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %truncate_payload(&raw),
                    "Malformed action definition, treating as absent"
                );
                metrics::counter!("catalog.malformed").increment(1);
                None
            }
        });
        self.definitions.put(key, definition.clone());
        definition
    }

    /// Every config key stored for a site, for operator inspection.
    pub async fn list_site_config_keys(&self, site_id: &str) -> FunnelResult<Vec<String>> {
        Ok(self.store.list(&keys::site_prefix(site_id)).await?)
    }

    /// Drop expired cache entries. Call this periodically from a background task.
    pub fn sweep(&self) -> usize {
        self.key_lists.evict_expired() + self.definitions.evict_expired()
    }
}

fn parse_key_list(key: &str, raw: &str) -> Vec<String> {
    match decode_stored::<Vec<Value>>(key, raw) {
        Ok(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!(error = %e, payload = %truncate_payload(raw), "Malformed action list, expected a JSON array");
            metrics::counter!("catalog.malformed").increment(1);
            Vec::new()
        }
    }
}
