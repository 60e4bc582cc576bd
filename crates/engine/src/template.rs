//! Placeholder template resolution over untyped JSON structures.
//!
//! A placeholder is the literal marker `PARAM:` followed by an upper-case
//! identifier (`[A-Z][A-Z0-9_]*`), e.g. `PARAM:ORDER_ID`. Tokens are looked up
//! against four sources: the transaction state, the payment confirmation, the
//! inbound request and configured secrets. Unknown tokens resolve to `""`.

use chrono::{DateTime, SecondsFormat, Utc};
use funnel_core::types::{FunnelStep, RequestContext, TransactionState};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

const MARKER: &str = "PARAM:";

/// Closed set of secret/environment tokens exposed to templates.
const SECRET_TOKENS: &[&str] = &[
    "FB_PIXEL_ID",
    "FB_ACCESS_TOKEN",
    "FB_TEST_EVENT_CODE",
    "GA_MEASUREMENT_ID",
    "GA_API_SECRET",
    "TT_PIXEL_ID",
    "TT_ACCESS_TOKEN",
];

/// A recognised placeholder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    // Payment confirmation
    OrderId,
    OrderTotal,
    Currency,
    ProductId,
    EmailHash,
    PhoneHash,
    // Transaction state
    TransactionId,
    SiteId,
    CampaignId,
    IsScrub,
    ClickId,
    AffiliateId,
    NetworkId,
    SubId(u8),
    Step,
    // Inbound request
    IpAddress,
    UserAgent,
    PageUrl,
    Fbp,
    Fbc,
    // Secrets
    Secret(&'static str),
    // Clock
    Timestamp,
    TimestampMs,
    IsoTimestamp,
}

impl Token {
    pub fn parse(name: &str) -> Option<Token> {
        let token = match name {
            "ORDER_ID" => Token::OrderId,
            "ORDER_TOTAL" => Token::OrderTotal,
            "CURRENCY" => Token::Currency,
            "PRODUCT_ID" => Token::ProductId,
            "EMAIL_HASH" => Token::EmailHash,
            "PHONE_HASH" => Token::PhoneHash,
            "TRANSACTION_ID" => Token::TransactionId,
            "SITE_ID" => Token::SiteId,
            "CAMPAIGN_ID" => Token::CampaignId,
            "IS_SCRUB" => Token::IsScrub,
            "CLICK_ID" => Token::ClickId,
            "AFFILIATE_ID" => Token::AffiliateId,
            "NETWORK_ID" => Token::NetworkId,
            "SUB_ID" => Token::SubId(1),
            "SUB_ID2" => Token::SubId(2),
            "SUB_ID3" => Token::SubId(3),
            "SUB_ID4" => Token::SubId(4),
            "SUB_ID5" => Token::SubId(5),
            "STEP" => Token::Step,
            "IP_ADDRESS" => Token::IpAddress,
            "USER_AGENT" => Token::UserAgent,
            "PAGE_URL" => Token::PageUrl,
            "FBP" => Token::Fbp,
            "FBC" => Token::Fbc,
            "TIMESTAMP" => Token::Timestamp,
            "TIMESTAMP_MS" => Token::TimestampMs,
            "ISO_TIMESTAMP" => Token::IsoTimestamp,
            other => Token::Secret(SECRET_TOKENS.iter().copied().find(|s| *s == other)?),
        };
        Some(token)
    }
}

/// Everything a template may read. Built once per dispatch; `now` pins the clock.
pub struct TemplateSources<'a> {
    pub state: &'a TransactionState,
    pub step: FunnelStep,
    pub confirmation: &'a Value,
    pub request: &'a RequestContext,
    /// Secret values keyed by upper-case token name.
    pub env: &'a HashMap<String, String>,
    pub now: DateTime<Utc>,
}

impl<'a> TemplateSources<'a> {
    fn confirmation_field(&self, keys: &[&str]) -> Option<String> {
        let obj = self.confirmation.as_object()?;
        keys.iter()
            .filter_map(|k| obj.get(*k))
            .map(scalar_to_string)
            .find(|s| !s.is_empty())
    }

    fn lookup(&self, token: Token) -> String {
        let tracking = &self.state.tracking_params;
        let owned = |v: Option<&str>| v.unwrap_or_default().to_string();

        match token {
            Token::OrderId => self
                .confirmation_field(&["orderId", "order_id", "OrderId"])
                .or_else(|| self.state.order_id(self.step).map(str::to_string))
                .unwrap_or_default(),
            Token::OrderTotal => self
                .confirmation_field(&["orderTotal", "order_total", "totalAmount", "total", "amount"])
                .unwrap_or_default(),
            Token::Currency => self
                .confirmation_field(&["currency", "currencyCode"])
                .unwrap_or_default(),
            Token::ProductId => self
                .confirmation_field(&["productId", "product_id"])
                .unwrap_or_default(),
            Token::EmailHash => self
                .confirmation_field(&["email", "emailAddress"])
                .map(|v| sha256_normalized(&v))
                .unwrap_or_default(),
            Token::PhoneHash => self
                .confirmation_field(&["phone", "phoneNumber"])
                .map(|v| sha256_normalized(&v))
                .unwrap_or_default(),
            Token::TransactionId => self.state.id.clone(),
            Token::SiteId => self.state.site_id.clone(),
            Token::CampaignId => self.state.scrub_decision.target_campaign_id.clone(),
            Token::IsScrub => self.state.scrub_decision.is_scrub.to_string(),
            Token::ClickId => owned(tracking.click_id()),
            Token::AffiliateId => owned(tracking.affiliate_id()),
            Token::NetworkId => owned(tracking.network_id()),
            Token::SubId(n) => owned(tracking.sub_id(n)),
            Token::Step => self.step.to_string(),
            Token::IpAddress => owned(self.request.ip.as_deref()),
            Token::UserAgent => owned(self.request.user_agent.as_deref()),
            Token::PageUrl => owned(self.request.page_url.as_deref()),
            Token::Fbp => owned(self.request.cookie("_fbp")),
            Token::Fbc => owned(self.request.cookie("_fbc")),
            Token::Secret(name) => self.env.get(name).cloned().unwrap_or_default(),
            Token::Timestamp => self.now.timestamp().to_string(),
            Token::TimestampMs => self.now.timestamp_millis().to_string(),
            Token::IsoTimestamp => self.now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn sha256_normalized(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Pure resolver. Never fails and never mutates its inputs.
#[derive(Debug, Clone, Default)]
pub struct TemplateResolver {
    optional_fields: HashSet<String>,
}

impl TemplateResolver {
    /// `optional_fields` names object keys that are dropped from the output
    /// when their resolved value is the empty string.
    pub fn new<I, S>(optional_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            optional_fields: optional_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve an arbitrary template structure, returning a new value of the same shape.
    pub fn resolve(&self, template: &Value, sources: &TemplateSources<'_>) -> Value {
        match template {
            Value::String(s) => Value::String(self.resolve_str(s, sources)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v, sources)).collect()),
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    let resolved = self.resolve(value, sources);
                    if resolved.as_str() == Some("") && self.optional_fields.contains(key) {
                        continue;
                    }
                    out.insert(key.clone(), resolved);
                }
                Value::Object(out)
            }
            scalar => scalar.clone(),
        }
    }

    /// Replace every placeholder embedded in `template`.
    pub fn resolve_str(&self, template: &str, sources: &TemplateSources<'_>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find(MARKER) {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + MARKER.len()..];
            let name_len = identifier_len(after);
            if name_len == 0 {
                // Bare marker with no identifier stays literal
                out.push_str(MARKER);
                rest = after;
                continue;
            }
            let name = &after[..name_len];
            if let Some(token) = Token::parse(name) {
                out.push_str(&sources.lookup(token));
            }
            rest = &after[name_len..];
        }
        out.push_str(rest);
        out
    }
}

/// Length in bytes of the `[A-Z][A-Z0-9_]*` identifier at the start of `s`.
fn identifier_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    if !bytes.first().is_some_and(u8::is_ascii_uppercase) {
        return 0;
    }
    bytes
        .iter()
        .take_while(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || **b == b'_')
        .count()
}
