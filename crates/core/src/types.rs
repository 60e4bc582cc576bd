use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FunnelError;

/// Lifecycle status of a funnel traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processed,
    Failed,
    UpsellAttempted,
    UpsellProcessed,
    PaypalRedirect,
    Error,
}

/// One stage of the purchase funnel. Serialized as `initial`, `upsell1`, `upsell2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunnelStep {
    Initial,
    Upsell(u32),
}

impl FunnelStep {
    pub fn is_upsell(&self) -> bool {
        matches!(self, FunnelStep::Upsell(_))
    }
}

impl fmt::Display for FunnelStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunnelStep::Initial => f.write_str("initial"),
            FunnelStep::Upsell(n) => write!(f, "upsell{n}"),
        }
    }
}

impl FromStr for FunnelStep {
    type Err = FunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "initial" {
            return Ok(FunnelStep::Initial);
        }
        let n = s
            .strip_prefix("upsell")
            .and_then(|rest| rest.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| FunnelError::InvalidInput(format!("unknown funnel step '{s}'")))?;
        Ok(FunnelStep::Upsell(n))
    }
}

impl Serialize for FunnelStep {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FunnelStep {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Affiliate/network/sub-id attribution fields captured at campaign decision time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingParams(BTreeMap<String, String>);

const AFFILIATE_KEYS: &[&str] = &["affId", "affid", "affiliateId", "affiliate_id"];
const NETWORK_KEYS: &[&str] = &["networkId", "network_id", "network", "nid"];
const CLICK_KEYS: &[&str] = &["clickId", "click_id", "clickid", "cid"];

impl TrackingParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an arbitrary JSON object; scalar values are stringified and
    /// nested values or nulls are skipped.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut params = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (key, v) in obj {
                let s = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                params.insert(key.clone(), s);
            }
        }
        Self(params)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// First non-empty value among the given aliases.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.get(k))
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    pub fn affiliate_id(&self) -> Option<&str> {
        self.first_of(AFFILIATE_KEYS)
    }

    pub fn network_id(&self) -> Option<&str> {
        self.first_of(NETWORK_KEYS)
    }

    pub fn click_id(&self) -> Option<&str> {
        self.first_of(CLICK_KEYS)
    }

    /// Sub-id slot `n` (1-based). Slot 1 also answers to the bare `subId` name.
    pub fn sub_id(&self, n: u8) -> Option<&str> {
        let camel = format!("subId{n}");
        let snake = format!("sub_id{n}");
        let short = format!("sub{n}");
        if n == 1 {
            self.first_of(&["subId", "sub_id", camel.as_str(), snake.as_str(), short.as_str()])
        } else {
            self.first_of(&[camel.as_str(), snake.as_str(), short.as_str()])
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Scrub routing decision. Set once at creation, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrubDecision {
    pub is_scrub: bool,
    pub target_campaign_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub step: String,
}

/// Durable record of one funnel traversal, stored under `txn_<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionState {
    pub id: String,
    #[serde(default)]
    pub site_id: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tracking_params: TrackingParams,
    pub scrub_decision: ScrubDecision,
    /// Idempotency ledger: step name -> actions already fired.
    #[serde(default)]
    pub step_processed_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub order_ids_by_step: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl TransactionState {
    pub fn new(
        id: impl Into<String>,
        site_id: impl Into<String>,
        tracking_params: TrackingParams,
        scrub_decision: ScrubDecision,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            site_id: site_id.into(),
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
            tracking_params,
            scrub_decision,
            step_processed_flags: BTreeMap::new(),
            order_ids_by_step: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn is_step_processed(&self, step: FunnelStep) -> bool {
        self.step_processed_flags
            .get(&step.to_string())
            .copied()
            .unwrap_or(false)
    }

    pub fn mark_step_processed(&mut self, step: FunnelStep, now: DateTime<Utc>) {
        self.step_processed_flags.insert(step.to_string(), true);
        self.updated_at = now;
    }

    pub fn order_id(&self, step: FunnelStep) -> Option<&str> {
        self.order_ids_by_step.get(&step.to_string()).map(String::as_str)
    }

    pub fn record_order(&mut self, step: FunnelStep, order_id: impl Into<String>, now: DateTime<Utc>) {
        self.order_ids_by_step.insert(step.to_string(), order_id.into());
        self.updated_at = now;
    }

    pub fn set_status(&mut self, status: TransactionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn record_error(&mut self, step: FunnelStep, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(LastError {
            timestamp: now,
            message: message.into(),
            step: step.to_string(),
        });
        self.updated_at = now;
    }
}

fn default_method() -> String {
    "POST".to_string()
}

/// Outbound webhook fired from the server. Every field may carry placeholder tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSideAction {
    #[serde(default)]
    pub provider: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    #[serde(default, alias = "body", skip_serializing_if = "Option::is_none")]
    pub body_template: Option<serde_json::Value>,
}

/// Script handed back to the client for in-browser execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAction {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(alias = "script")]
    pub script_template: String,
}

/// Configured conversion action, stored under `<siteId>_<actionKey>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionDefinition {
    #[serde(alias = "server_side", alias = "serverSide", alias = "server")]
    ServerSide(ServerSideAction),
    #[serde(alias = "client_side", alias = "clientSide", alias = "client")]
    ClientSide(ClientSideAction),
}

impl ActionDefinition {
    pub fn provider(&self) -> Option<&str> {
        match self {
            ActionDefinition::ServerSide(a) => a.provider.as_deref(),
            ActionDefinition::ClientSide(a) => a.provider.as_deref(),
        }
    }
}

/// Attributes of the inbound request exposed to action templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub page_url: Option<String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Affiliate identifier carried by the request; selects the action list.
    pub affiliate_id: Option<String>,
}

impl RequestContext {
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Parse a `Cookie:` header value into name/value pairs.
    pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
        header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().trim_matches('"').to_string()))
            })
            .collect()
    }
}

/// Result of `DecideCampaign`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDecision {
    pub target_campaign_id: String,
    pub transaction_id: String,
}

/// Result of `DispatchStepActions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub client_side_actions: Vec<String>,
}

impl DispatchResult {
    pub fn empty() -> Self {
        Self::default()
    }
}
