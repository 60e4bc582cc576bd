//! REST API handlers for campaign decisions, funnel steps and operational endpoints.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use funnel_core::types::{CampaignDecision, DispatchResult, FunnelStep, RequestContext, TrackingParams, TransactionState};
use funnel_core::FunnelError;
use funnel_engine::{ActionCatalog, FunnelService, ScrubEngine, ScrubRequest, StepOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Maximum string field length (transaction id, site id, affiliate id).
const MAX_FIELD_LEN: usize = 256;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub scrub: Arc<ScrubEngine>,
    pub funnel: Arc<FunnelService>,
    pub catalog: Arc<ActionCatalog>,
    pub node_id: String,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideCampaignRequest {
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub tracking_params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStepRequest {
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default = "empty_object")]
    pub payment: Value,
    #[serde(default, alias = "affid", alias = "affiliateId")]
    pub aff_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default = "empty_object")]
    pub confirmation_data: Value,
    #[serde(default, alias = "affid", alias = "affiliateId")]
    pub aff_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn reject(message: &str) -> ApiError {
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: message.to_string(),
        }),
    )
}

/// Map an engine error: caller-input problems are 400, anything else is logged and 500.
fn error_response(err: FunnelError) -> ApiError {
    if err.is_caller_error() {
        warn!(error = %err, "Request rejected");
        return reject(&err.to_string());
    }
    error!(error = %err, "Request failed");
    metrics::counter!("api.errors").increment(1);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal_error".to_string(),
            message: "Internal processing error".to_string(),
        }),
    )
}

fn check_len(field: &str, value: &str) -> Result<(), ApiError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(reject(&format!("'{field}' exceeds maximum length")));
    }
    Ok(())
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Build the template-visible view of the inbound request.
pub fn request_context(headers: &HeaderMap, peer: Option<SocketAddr>, affiliate_id: Option<String>) -> RequestContext {
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()));
    let cookies = header_str(headers, header::COOKIE)
        .map(|raw| RequestContext::parse_cookie_header(&raw))
        .unwrap_or_default();

    RequestContext {
        ip,
        user_agent: header_str(headers, header::USER_AGENT),
        page_url: header_str(headers, "x-page-url").or_else(|| header_str(headers, header::REFERER)),
        cookies,
        affiliate_id: affiliate_id.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
    }
}

fn affiliate_from(body: Option<String>, query: &HashMap<String, String>) -> Option<String> {
    body.or_else(|| query.get("affId").cloned())
        .or_else(|| query.get("affid").cloned())
}

/// POST /v1/campaign/decide
pub async fn decide_campaign(
    State(state): State<AppState>,
    Json(body): Json<DecideCampaignRequest>,
) -> Result<Json<CampaignDecision>, ApiError> {
    check_len("siteId", &body.site_id)?;
    check_len("transactionId", &body.transaction_id)?;
    if !body.tracking_params.is_null() && !body.tracking_params.is_object() {
        return Err(reject("'trackingParams' must be an object"));
    }

    let request = ScrubRequest {
        site_id: body.site_id,
        transaction_id: body.transaction_id,
        tracking_params: TrackingParams::from_json(&body.tracking_params),
    };
    state
        .scrub
        .decide_campaign(request)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /v1/checkout
pub async fn checkout(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<PaymentStepRequest>,
) -> Result<Json<StepOutcome>, ApiError> {
    check_len("transactionId", &body.transaction_id)?;
    let ctx = request_context(&headers, peer.map(|c| c.0), affiliate_from(body.aff_id, &query));
    state
        .funnel
        .process_checkout(&body.transaction_id, body.payment, &ctx)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /v1/upsell/:n
pub async fn upsell(
    State(state): State<AppState>,
    Path(upsell): Path<u32>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<PaymentStepRequest>,
) -> Result<Json<StepOutcome>, ApiError> {
    check_len("transactionId", &body.transaction_id)?;
    let ctx = request_context(&headers, peer.map(|c| c.0), affiliate_from(body.aff_id, &query));
    state
        .funnel
        .process_upsell(&body.transaction_id, upsell, body.payment, &ctx)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /v1/transactions/:id/steps/:step/actions
pub async fn dispatch_actions(
    State(state): State<AppState>,
    Path((transaction_id, step)): Path<(String, String)>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<DispatchRequest>,
) -> Result<Json<DispatchResult>, ApiError> {
    check_len("transactionId", &transaction_id)?;
    let step: FunnelStep = step.parse().map_err(error_response)?;
    let ctx = request_context(&headers, peer.map(|c| c.0), affiliate_from(body.aff_id, &query));
    state
        .funnel
        .dispatcher()
        .dispatch_step_actions(&transaction_id, step, &body.confirmation_data, &ctx)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /v1/transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionState>, ApiError> {
    match state.funnel.transaction(&transaction_id).await {
        Ok(Some(txn)) => Ok(Json(txn)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "not_found".to_string(),
                message: "transaction not found".to_string(),
            }),
        )),
        Err(e) => Err(error_response(e)),
    }
}

/// GET /v1/sites/:site_id/config-keys
pub async fn site_config_keys(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    check_len("siteId", &site_id)?;
    state
        .catalog
        .list_site_config_keys(&site_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: Readiness probe.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live: Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}
