//! End-to-end funnel flow over the in-memory store: campaign decision,
//! checkout, upsell, and action dispatch with a recording transport.

use async_trait::async_trait;
use funnel_core::config::ScrubConfig;
use funnel_core::types::{FunnelStep, RequestContext, TrackingParams, TransactionStatus};
use funnel_core::{FunnelError, FunnelResult};
use funnel_engine::{
    ActionCatalog, ActionDispatcher, ActionTransport, BackgroundTasks, FunnelService, GatewayOutcome,
    OutboundRequest, PaymentGateway, PaymentRequest, ScrubEngine, ScrubRequest, TemplateResolver,
    TransactionStore,
};
use funnel_store::{KeyValueStore, MemoryStore};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutboundRequest>>,
}

#[async_trait]
impl ActionTransport for RecordingTransport {
    async fn send(&self, request: OutboundRequest) -> FunnelResult<u16> {
        let url = request.url.clone();
        self.sent.lock().push(request);
        if url.contains("unreachable.invalid") {
            return Err(FunnelError::Downstream("dns error".into()));
        }
        if url.contains("/500") {
            return Ok(500);
        }
        Ok(204)
    }
}

/// Hands out scripted outcomes in order.
struct ScriptedGateway {
    outcomes: Mutex<VecDeque<FunnelResult<GatewayOutcome>>>,
    calls: Mutex<Vec<PaymentRequest>>,
}

impl ScriptedGateway {
    fn new(outcomes: Vec<FunnelResult<GatewayOutcome>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: &PaymentRequest) -> FunnelResult<GatewayOutcome> {
        self.calls.lock().push(request.clone());
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(FunnelError::Downstream("no scripted outcome".into())))
    }
}

fn approved(order_id: &str, total: f64) -> FunnelResult<GatewayOutcome> {
    Ok(GatewayOutcome::from_response(json!({
        "success": true,
        "orderId": order_id,
        "orderTotal": total,
        "email": "buyer@example.com"
    })))
}

struct Funnel {
    kv: Arc<MemoryStore>,
    tasks: Arc<BackgroundTasks>,
    transport: Arc<RecordingTransport>,
    scrub: ScrubEngine,
    service: FunnelService,
    gateway: Arc<ScriptedGateway>,
}

fn funnel(outcomes: Vec<FunnelResult<GatewayOutcome>>) -> Funnel {
    let kv = Arc::new(MemoryStore::new());
    let tasks = Arc::new(BackgroundTasks::new());
    let states = Arc::new(TransactionStore::new(kv.clone(), Duration::from_secs(86_400)));
    let catalog = Arc::new(ActionCatalog::new(kv.clone(), Duration::from_secs(60), 1000));
    let transport = Arc::new(RecordingTransport::default());
    let gateway = Arc::new(ScriptedGateway::new(outcomes));

    let mut secrets = HashMap::new();
    secrets.insert("FB_PIXEL_ID".to_string(), "PIXEL".to_string());
    let dispatcher = Arc::new(ActionDispatcher::new(
        states.clone(),
        catalog,
        TemplateResolver::new(["test_event_code"]),
        transport.clone(),
        tasks.clone(),
        &secrets,
        Duration::from_secs(2),
    ));
    let scrub = ScrubEngine::with_rng(
        kv.clone(),
        states.clone(),
        ScrubConfig::default(),
        tasks.clone(),
        StdRng::seed_from_u64(11),
    );
    let service = FunnelService::new(states, dispatcher, gateway.clone());

    Funnel {
        kv,
        tasks,
        transport,
        scrub,
        service,
        gateway,
    }
}

async fn put_json(kv: &MemoryStore, key: &str, value: Value) {
    kv.put(key, &value.to_string(), None).await.unwrap();
}

async fn decide(f: &Funnel, txn: &str) {
    let mut tracking_params = TrackingParams::new();
    tracking_params.insert("affId", "Aff1");
    tracking_params.insert("clickId", "CLK");
    f.scrub
        .decide_campaign(ScrubRequest {
            site_id: "shop".into(),
            transaction_id: txn.into(),
            tracking_params,
        })
        .await
        .unwrap();
    f.tasks.drain().await;
}

fn browser() -> RequestContext {
    RequestContext {
        ip: Some("192.0.2.10".into()),
        user_agent: Some("Mozilla/5.0".into()),
        page_url: Some("https://shop.example.com/checkout".into()),
        affiliate_id: Some("AFF1".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_checkout_fires_actions_once() {
    let f = funnel(vec![approved("ORD-1", 39.5)]);
    put_json(&f.kv, "shop_initial_affid_aff1_NormalActions", json!(["capi", "pixel"])).await;
    put_json(
        &f.kv,
        "shop_capi",
        json!({
            "type": "server-side",
            "url": "https://graph.example.com/PARAM:FB_PIXEL_ID/events",
            "bodyTemplate": {
                "event_id": "PARAM:ORDER_ID",
                "value": "PARAM:ORDER_TOTAL",
                "em": "PARAM:EMAIL_HASH",
                "click": "PARAM:CLICK_ID",
                "test_event_code": "PARAM:FB_TEST_EVENT_CODE"
            }
        }),
    )
    .await;
    put_json(
        &f.kv,
        "shop_pixel",
        json!({ "type": "client-side", "scriptTemplate": "<img src='https://px.example.com/c?o=PARAM:ORDER_ID'>" }),
    )
    .await;

    decide(&f, "txn-1").await;

    let outcome = f
        .service
        .process_checkout("txn-1", json!({ "card": "tok_visa" }), &browser())
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.order_id.as_deref(), Some("ORD-1"));
    assert_eq!(outcome.client_side_actions, vec!["<img src='https://px.example.com/c?o=ORD-1'>"]);
    f.tasks.drain().await;

    {
        let sent = f.transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://graph.example.com/PIXEL/events");
        let body = match &sent[0].body {
            Some(funnel_engine::OutboundBody::Json(body)) => body.clone(),
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(body["event_id"], "ORD-1");
        assert_eq!(body["value"], "39.5");
        assert_eq!(body["click"], "CLK");
        assert_eq!(body["em"].as_str().map(str::len), Some(64));
        assert!(body.get("test_event_code").is_none());
    }

    let state = f.service.transaction("txn-1").await.unwrap().unwrap();
    assert_eq!(state.status, TransactionStatus::Processed);
    assert_eq!(state.order_id(FunnelStep::Initial), Some("ORD-1"));
    assert!(state.is_step_processed(FunnelStep::Initial));

    // Re-dispatching the same step is a no-op
    let again = f
        .service
        .dispatcher()
        .dispatch_step_actions("txn-1", FunnelStep::Initial, &json!({ "orderId": "ORD-1" }), &browser())
        .await
        .unwrap();
    f.tasks.drain().await;
    assert!(again.client_side_actions.is_empty());
    assert_eq!(f.transport.sent.lock().len(), 1);
}

#[tokio::test]
async fn test_unreachable_action_does_not_block_batch() {
    let f = funnel(vec![approved("ORD-2", 10.0)]);
    put_json(&f.kv, "shop_initial_affid_aff1_NormalActions", json!(["dead", "flaky", "pixel"])).await;
    put_json(&f.kv, "shop_dead", json!({ "type": "server-side", "url": "https://unreachable.invalid/hook" })).await;
    put_json(&f.kv, "shop_flaky", json!({ "type": "server-side", "url": "https://hooks.example.com/500" })).await;
    put_json(&f.kv, "shop_pixel", json!({ "type": "client-side", "scriptTemplate": "<script>fire()</script>" })).await;

    decide(&f, "txn-2").await;
    let outcome = f
        .service
        .process_checkout("txn-2", json!({}), &browser())
        .await
        .unwrap();
    f.tasks.drain().await;

    assert!(outcome.success);
    assert_eq!(outcome.client_side_actions, vec!["<script>fire()</script>"]);
    assert_eq!(f.transport.sent.lock().len(), 2);
    let state = f.service.transaction("txn-2").await.unwrap().unwrap();
    assert!(state.is_step_processed(FunnelStep::Initial));
}

#[tokio::test]
async fn test_upsell_records_order_and_status() {
    let f = funnel(vec![approved("ORD-3", 20.0), approved("UP-3", 15.0)]);
    put_json(&f.kv, "shop_upsell1_affid_aff1_NormalActions", json!(["pixel"])).await;
    put_json(&f.kv, "shop_pixel", json!({ "type": "client-side", "scriptTemplate": "PARAM:STEP:PARAM:ORDER_ID" })).await;

    decide(&f, "txn-3").await;
    let checkout = f
        .service
        .process_checkout("txn-3", json!({}), &browser())
        .await
        .unwrap();
    assert!(checkout.client_side_actions.is_empty());
    f.tasks.drain().await;

    let upsell = f
        .service
        .process_upsell("txn-3", 1, json!({ "productId": "P-9" }), &browser())
        .await
        .unwrap();
    f.tasks.drain().await;

    assert_eq!(upsell.client_side_actions, vec!["upsell1:UP-3"]);
    let state = f.service.transaction("txn-3").await.unwrap().unwrap();
    assert_eq!(state.status, TransactionStatus::UpsellProcessed);
    assert_eq!(state.order_id(FunnelStep::Initial), Some("ORD-3"));
    assert_eq!(state.order_id(FunnelStep::Upsell(1)), Some("UP-3"));
    assert!(state.is_step_processed(FunnelStep::Upsell(1)));

    let calls = f.gateway.calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].step, FunnelStep::Upsell(1));
}

#[tokio::test]
async fn test_upsell_right_after_checkout_keeps_both_steps() {
    let f = funnel(vec![approved("ORD-9", 20.0), approved("UP-9", 15.0)]);
    put_json(&f.kv, "shop_initial_affid_aff1_NormalActions", json!(["pixel"])).await;
    put_json(&f.kv, "shop_upsell1_affid_aff1_NormalActions", json!(["pixel"])).await;
    put_json(&f.kv, "shop_pixel", json!({ "type": "client-side", "scriptTemplate": "PARAM:ORDER_ID" })).await;

    decide(&f, "txn-9").await;
    // No drain in between: the checkout's processed-flag write is still pending
    let checkout = f
        .service
        .process_checkout("txn-9", json!({}), &browser())
        .await
        .unwrap();
    let upsell = f
        .service
        .process_upsell("txn-9", 1, json!({}), &browser())
        .await
        .unwrap();
    f.tasks.drain().await;

    assert_eq!(checkout.client_side_actions, vec!["ORD-9"]);
    assert_eq!(upsell.client_side_actions, vec!["UP-9"]);

    let state = f.service.transaction("txn-9").await.unwrap().unwrap();
    assert!(state.is_step_processed(FunnelStep::Initial));
    assert!(state.is_step_processed(FunnelStep::Upsell(1)));
    assert_eq!(state.status, TransactionStatus::UpsellProcessed);
    assert_eq!(state.order_id(FunnelStep::Initial), Some("ORD-9"));
    assert_eq!(state.order_id(FunnelStep::Upsell(1)), Some("UP-9"));

    // The stored ledger now gates a replayed checkout dispatch on its own
    let replay = f
        .service
        .dispatcher()
        .dispatch_step_actions("txn-9", FunnelStep::Initial, &json!({}), &browser())
        .await
        .unwrap();
    assert!(replay.client_side_actions.is_empty());
}

#[tokio::test]
async fn test_declined_checkout_fires_nothing() {
    let declined = Ok(GatewayOutcome::from_response(json!({ "success": false, "message": "insufficient funds" })));
    let f = funnel(vec![declined]);
    put_json(&f.kv, "shop_initial_affid_aff1_NormalActions", json!(["pixel"])).await;
    put_json(&f.kv, "shop_pixel", json!({ "type": "client-side", "scriptTemplate": "x" })).await;

    decide(&f, "txn-4").await;
    let outcome = f
        .service
        .process_checkout("txn-4", json!({}), &browser())
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.message.as_deref(), Some("insufficient funds"));
    assert!(outcome.client_side_actions.is_empty());
    let state = f.service.transaction("txn-4").await.unwrap().unwrap();
    assert_eq!(state.status, TransactionStatus::Failed);
    assert!(!state.is_step_processed(FunnelStep::Initial));
    assert_eq!(state.last_error.map(|e| e.message), Some("insufficient funds".to_string()));
}

#[tokio::test]
async fn test_redirect_and_gateway_error_statuses() {
    let redirect = Ok(GatewayOutcome::from_response(json!({ "redirectUrl": "https://paypal.example/approve" })));
    let f = funnel(vec![redirect, Err(FunnelError::Downstream("timeout".into()))]);

    decide(&f, "txn-5").await;
    let outcome = f
        .service
        .process_checkout("txn-5", json!({}), &browser())
        .await
        .unwrap();
    assert_eq!(outcome.redirect_url.as_deref(), Some("https://paypal.example/approve"));
    let state = f.service.transaction("txn-5").await.unwrap().unwrap();
    assert_eq!(state.status, TransactionStatus::PaypalRedirect);

    let outcome = f
        .service
        .process_checkout("txn-5", json!({}), &browser())
        .await
        .unwrap();
    assert!(!outcome.success);
    let state = f.service.transaction("txn-5").await.unwrap().unwrap();
    assert_eq!(state.status, TransactionStatus::Error);
    assert_eq!(state.last_error.map(|e| e.step), Some("initial".to_string()));
}

#[tokio::test]
async fn test_lost_state_fails_closed() {
    let f = funnel(vec![approved("ORD-6", 5.0)]);
    put_json(&f.kv, "shop_initial_affid_aff1_NormalActions", json!(["pixel"])).await;
    put_json(&f.kv, "shop_pixel", json!({ "type": "client-side", "scriptTemplate": "x" })).await;

    let outcome = f
        .service
        .process_checkout("never-decided", json!({}), &browser())
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.client_side_actions.is_empty());
    assert!(f.service.transaction("never-decided").await.unwrap().is_none());
}

#[tokio::test]
async fn test_caller_input_rejected_before_mutation() {
    let f = funnel(vec![]);
    decide(&f, "txn-7").await;

    let err = f
        .service
        .process_checkout("", json!({}), &browser())
        .await
        .unwrap_err();
    assert!(err.is_caller_error());
    let err = f
        .service
        .process_upsell("txn-7", 1, json!("not-an-object"), &browser())
        .await
        .unwrap_err();
    assert!(err.is_caller_error());
    let err = f
        .service
        .process_upsell("txn-7", 0, json!({}), &browser())
        .await
        .unwrap_err();
    assert!(err.is_caller_error());

    assert!(f.gateway.calls.lock().is_empty());
    let state = f.service.transaction("txn-7").await.unwrap().unwrap();
    assert_eq!(state.status, TransactionStatus::Pending);
}
