//! Outbound HTTP primitive used by server-side actions.

use async_trait::async_trait;
use funnel_core::{FunnelError, FunnelResult};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    Json(Value),
    Text(String),
}

/// A fully resolved webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<OutboundBody>,
}

/// Sends one request and reports the HTTP status. Network failures are errors;
/// non-2xx statuses are not.
#[async_trait]
pub trait ActionTransport: Send + Sync + 'static {
    async fn send(&self, request: OutboundRequest) -> FunnelResult<u16>;
}

/// `reqwest`-backed transport with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> FunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FunnelError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> FunnelResult<u16> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FunnelError::Template(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(OutboundBody::Json(body)) => builder.json(&body),
            Some(OutboundBody::Text(body)) => builder.body(body),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| FunnelError::Downstream(format!("{} {}: {e}", request.method, request.url)))?;
        Ok(response.status().as_u16())
    }
}
