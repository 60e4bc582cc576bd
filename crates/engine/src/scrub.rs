//! Scrub decision: routes a configured share of new transactions to the
//! site's alternate ("scrub") campaign.
//!
//! Percent precedence is affiliate > network > global; the first configured
//! value wins and an unconfigured site scrubs nothing. Campaign id defaults are
//! resolved here and nowhere else.

use chrono::Utc;
use funnel_core::config::ScrubConfig;
use funnel_core::keys;
use funnel_core::types::{CampaignDecision, ScrubDecision, TrackingParams, TransactionState};
use funnel_core::{FunnelError, FunnelResult};
use funnel_store::SharedStore;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::background::BackgroundTasks;
use crate::state::TransactionStore;

/// Which config level supplied the scrub percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentSource {
    Affiliate,
    Network,
    Global,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubPercent {
    pub value: u8,
    pub source: PercentSource,
}

/// Input to `DecideCampaign`.
#[derive(Debug, Clone)]
pub struct ScrubRequest {
    pub site_id: String,
    pub transaction_id: String,
    pub tracking_params: TrackingParams,
}

/// `true` when a uniform roll in `[0, 100)` falls under the percent.
pub fn roll_is_scrub(percent: u8, roll: f64) -> bool {
    roll < f64::from(percent)
}

/// Parse a stored percent. Out-of-range integers are clamped to `[0, 100]`.
fn parse_percent(raw: &str) -> Option<u8> {
    let value: i64 = raw.trim().parse().ok()?;
    Some(value.clamp(0, 100) as u8)
}

pub struct ScrubEngine {
    config_store: SharedStore,
    states: Arc<TransactionStore>,
    defaults: ScrubConfig,
    tasks: Arc<BackgroundTasks>,
    rng: Mutex<StdRng>,
}

impl ScrubEngine {
    pub fn new(
        config_store: SharedStore,
        states: Arc<TransactionStore>,
        defaults: ScrubConfig,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        Self::with_rng(config_store, states, defaults, tasks, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied generator (seeded in tests).
    pub fn with_rng(
        config_store: SharedStore,
        states: Arc<TransactionStore>,
        defaults: ScrubConfig,
        tasks: Arc<BackgroundTasks>,
        rng: StdRng,
    ) -> Self {
        Self {
            config_store,
            states,
            defaults,
            tasks,
            rng: Mutex::new(rng),
        }
    }

    /// Decide and persist the campaign for a new transaction. The state write
    /// is detached; the decision is returned even if that write later fails.
    /// A transaction that already has state keeps its original decision.
    pub async fn decide_campaign(&self, request: ScrubRequest) -> FunnelResult<CampaignDecision> {
        let site_id = request.site_id.trim();
        let transaction_id = request.transaction_id.trim();
        if site_id.is_empty() {
            return Err(FunnelError::InvalidInput("siteId is required".into()));
        }
        if transaction_id.is_empty() {
            return Err(FunnelError::InvalidInput("transactionId is required".into()));
        }

        match self.states.load(transaction_id).await {
            Ok(Some(existing)) => {
                debug!(transaction_id, "Transaction already decided, reusing decision");
                return Ok(CampaignDecision {
                    target_campaign_id: existing.scrub_decision.target_campaign_id,
                    transaction_id: transaction_id.to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!(transaction_id, error = %e, "State lookup failed, deciding fresh"),
        }

        let affiliate_id = request.tracking_params.affiliate_id().unwrap_or_default();
        let network_id = request.tracking_params.network_id().unwrap_or_default();
        let percent = self.resolve_percent(site_id, affiliate_id, network_id).await;

        let roll: f64 = self.rng.lock().gen_range(0.0..100.0);
        let is_scrub = roll_is_scrub(percent.value, roll);
        let target_campaign_id = self.campaign_id(site_id, is_scrub).await;

        metrics::counter!("scrub.decisions").increment(1);
        if is_scrub {
            metrics::counter!("scrub.scrubbed").increment(1);
        }
        info!(
            site_id,
            transaction_id,
            percent = percent.value,
            source = ?percent.source,
            is_scrub,
            campaign_id = %target_campaign_id,
            "Scrub decision made"
        );

        let state = TransactionState::new(
            transaction_id,
            site_id,
            request.tracking_params,
            ScrubDecision {
                is_scrub,
                target_campaign_id: target_campaign_id.clone(),
            },
            Utc::now(),
        );
        let states = self.states.clone();
        self.tasks.spawn("state_create", async move {
            if let Err(e) = states.save(&state).await {
                error!(transaction_id = %state.id, error = %e, "Failed to persist initial transaction state");
            }
        });

        Ok(CampaignDecision {
            target_campaign_id,
            transaction_id: transaction_id.to_string(),
        })
    }

    /// Resolve the scrub percent with affiliate > network > global precedence.
    pub async fn resolve_percent(&self, site_id: &str, affiliate_id: &str, network_id: &str) -> ScrubPercent {
        let mut candidates = Vec::with_capacity(3);
        if !affiliate_id.is_empty() {
            candidates.push((keys::affiliate_scrub_key(site_id, affiliate_id), PercentSource::Affiliate));
        }
        if !network_id.is_empty() {
            candidates.push((keys::network_scrub_key(site_id, network_id), PercentSource::Network));
        }
        candidates.push((keys::global_scrub_key(site_id), PercentSource::Global));

        for (key, source) in candidates {
            let Some(raw) = self.read_config(&key).await else {
                continue;
            };
            match parse_percent(&raw) {
                Some(value) => return ScrubPercent { value, source },
                None => warn!(key = %key, value = %raw, "Malformed scrub percent, skipping"),
            }
        }

        ScrubPercent {
            value: 0,
            source: PercentSource::Default,
        }
    }

    async fn campaign_id(&self, site_id: &str, is_scrub: bool) -> String {
        let (key, default) = if is_scrub {
            (keys::scrub_campaign_key(site_id), &self.defaults.default_scrub_campaign_id)
        } else {
            (keys::normal_campaign_key(site_id), &self.defaults.default_normal_campaign_id)
        };
        match self.read_config(&key).await {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => default.clone(),
        }
    }

    async fn read_config(&self, key: &str) -> Option<String> {
        match self.config_store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                error!(key, error = %e, "Config lookup failed");
                None
            }
        }
    }
}
