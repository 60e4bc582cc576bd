//! Durable transaction state, keyed `txn_<transactionId>`.

use funnel_core::error::{decode_stored, truncate_payload};
use funnel_core::keys;
use funnel_core::types::{FunnelStep, TransactionState};
use funnel_core::FunnelResult;
use funnel_store::SharedStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Typed access to transaction state. Every write refreshes the expiry.
pub struct TransactionStore {
    store: SharedStore,
    ttl: Duration,
}

impl TransactionStore {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Load a transaction. Missing and malformed records both yield `None`.
    pub async fn load(&self, transaction_id: &str) -> FunnelResult<Option<TransactionState>> {
        let key = keys::state_key(transaction_id);
        let Some(raw) = self.store.get(&key).await? else {
            debug!(transaction_id, "Transaction state not found");
            return Ok(None);
        };

        match decode_stored::<TransactionState>(&key, &raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %truncate_payload(&raw),
                    "Malformed transaction state, treating as absent"
                );
                metrics::counter!("state.malformed").increment(1);
                Ok(None)
            }
        }
    }

    pub async fn save(&self, state: &TransactionState) -> FunnelResult<()> {
        let json = serde_json::to_string(state)?;
        self.store
            .put(&keys::state_key(&state.id), &json, Some(self.ttl))
            .await?;
        Ok(())
    }

    /// Re-read the stored record, apply `apply` and write it back, so a writer
    /// only changes the fields it owns. Returns `None` when there is no record.
    pub async fn update<F>(&self, transaction_id: &str, apply: F) -> FunnelResult<Option<TransactionState>>
    where
        F: FnOnce(&mut TransactionState) + Send,
    {
        let Some(mut state) = self.load(transaction_id).await? else {
            return Ok(None);
        };
        apply(&mut state);
        self.save(&state).await?;
        Ok(Some(state))
    }

    /// Atomically claim the right to fire actions for `(transaction, step)`.
    /// Exactly one caller observes `true` while the claim is live.
    pub async fn claim_step(&self, transaction_id: &str, step: FunnelStep) -> FunnelResult<bool> {
        let claimed = self
            .store
            .put_if_absent(&keys::claim_key(transaction_id, step), "1", Some(self.ttl))
            .await?;
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use funnel_core::types::{ScrubDecision, TrackingParams, TransactionStatus};
    use funnel_store::{KeyValueStore, MemoryStore};
    use std::sync::Arc;

    fn sample_state(id: &str) -> TransactionState {
        TransactionState::new(
            id,
            "site-a",
            TrackingParams::new(),
            ScrubDecision {
                is_scrub: false,
                target_campaign_id: "1".into(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let kv = Arc::new(MemoryStore::new());
        let store = TransactionStore::new(kv.clone(), Duration::from_secs(60));

        let mut state = sample_state("t-1");
        state.set_status(TransactionStatus::Processed, Utc::now());
        store.save(&state).await.unwrap();

        let loaded = store.load("t-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(kv.get("txn_t-1").await.unwrap().is_some());
        assert!(store.load("t-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_state_is_absent() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("txn_bad", "{not json", None).await.unwrap();
        let store = TransactionStore::new(kv, Duration::from_secs(60));
        assert!(store.load("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_step_once_per_step() {
        let store = TransactionStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        assert!(store.claim_step("t-1", FunnelStep::Initial).await.unwrap());
        assert!(!store.claim_step("t-1", FunnelStep::Initial).await.unwrap());
        assert!(store.claim_step("t-1", FunnelStep::Upsell(1)).await.unwrap());
        assert!(store.claim_step("t-2", FunnelStep::Initial).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_keeps_fields_written_since_load() {
        let store = TransactionStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        store.save(&sample_state("t-1")).await.unwrap();

        store
            .update("t-1", |s| s.record_order(FunnelStep::Upsell(1), "UP-1", Utc::now()))
            .await
            .unwrap();

        let updated = store
            .update("t-1", |s| s.mark_step_processed(FunnelStep::Initial, Utc::now()))
            .await
            .unwrap()
            .unwrap();
        assert!(updated.is_step_processed(FunnelStep::Initial));
        assert_eq!(updated.order_id(FunnelStep::Upsell(1)), Some("UP-1"));

        assert!(store.update("missing", |_| {}).await.unwrap().is_none());
    }
}
