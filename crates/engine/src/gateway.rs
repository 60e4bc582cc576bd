//! Payment gateway seam. The gateway's wire format is owned elsewhere; this
//! module only normalizes its answer into a `GatewayOutcome`.

use async_trait::async_trait;
use funnel_core::types::FunnelStep;
use funnel_core::{FunnelError, FunnelResult};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub transaction_id: String,
    pub step: FunnelStep,
    pub payment: Value,
}

/// Normalized gateway answer. `raw_confirmation_data` seeds action templates.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOutcome {
    pub success: bool,
    pub order_id: Option<String>,
    /// Set when the payer must complete the payment off-site (PayPal).
    pub redirect_url: Option<String>,
    pub message: Option<String>,
    pub raw_confirmation_data: Value,
}

impl GatewayOutcome {
    /// Interpret a gateway JSON body.
    pub fn from_response(body: Value) -> Self {
        let success = body
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let order_id = text_field(&body, &["orderId", "order_id"]);
        let redirect_url = text_field(&body, &["redirectUrl", "redirect_url"]);
        let message = text_field(&body, &["message", "error", "declineReason"]);

        Self {
            success,
            order_id,
            redirect_url,
            message,
            raw_confirmation_data: body,
        }
    }
}

fn text_field(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| body.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    /// A declined payment is `Ok` with `success == false`; transport failures are `Err`.
    async fn charge(&self, request: &PaymentRequest) -> FunnelResult<GatewayOutcome>;
}

/// Gateway reached over HTTP with a JSON request/response.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPaymentGateway {
    pub fn new(endpoint: String, timeout: Duration) -> FunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FunnelError::Config(format!("failed to build gateway client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &PaymentRequest) -> FunnelResult<GatewayOutcome> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| FunnelError::Downstream(format!("payment gateway unreachable: {e}")))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            warn!(
                transaction_id = %request.transaction_id,
                step = %request.step,
                status = status.as_u16(),
                "Payment gateway returned an error status"
            );
            let mut outcome = GatewayOutcome::from_response(body);
            outcome.success = false;
            if outcome.message.is_none() {
                outcome.message = Some(format!("gateway status {}", status.as_u16()));
            }
            return Ok(outcome);
        }
        if body.is_null() {
            return Err(FunnelError::Downstream("payment gateway returned no JSON body".into()));
        }
        Ok(GatewayOutcome::from_response(body))
    }
}

/// Minimal confirmation payload when the gateway omits one.
pub fn confirmation_or_default(outcome: &GatewayOutcome) -> Value {
    match &outcome.raw_confirmation_data {
        Value::Object(_) => outcome.raw_confirmation_data.clone(),
        _ => json!({ "orderId": outcome.order_id }),
    }
}
