//! Per-step action dispatch.
//!
//! For one `(transaction, step)`: load state, pass the idempotency gate, mark
//! the step processed, look up the applicable actions and run them. Server-side
//! webhooks are detached; client-side scripts are resolved inline and returned.

use chrono::Utc;
use funnel_core::types::{
    ActionDefinition, ClientSideAction, DispatchResult, FunnelStep, RequestContext, ServerSideAction,
};
use funnel_core::{FunnelError, FunnelResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::background::BackgroundTasks;
use crate::catalog::ActionCatalog;
use crate::state::TransactionStore;
use crate::template::{TemplateResolver, TemplateSources};
use crate::transport::{ActionTransport, OutboundBody, OutboundRequest};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

pub struct ActionDispatcher {
    states: Arc<TransactionStore>,
    catalog: Arc<ActionCatalog>,
    resolver: TemplateResolver,
    transport: Arc<dyn ActionTransport>,
    tasks: Arc<BackgroundTasks>,
    env: HashMap<String, String>,
    action_timeout: Duration,
}

impl ActionDispatcher {
    /// `secrets` keys are matched case-insensitively against template tokens.
    pub fn new(
        states: Arc<TransactionStore>,
        catalog: Arc<ActionCatalog>,
        resolver: TemplateResolver,
        transport: Arc<dyn ActionTransport>,
        tasks: Arc<BackgroundTasks>,
        secrets: &HashMap<String, String>,
        action_timeout: Duration,
    ) -> Self {
        let env = secrets
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.clone()))
            .collect();
        Self {
            states,
            catalog,
            resolver,
            transport,
            tasks,
            env,
            action_timeout,
        }
    }

    /// Fire every action configured for this step, at most once per
    /// `(transaction, step)`. Only caller-input problems are returned as errors;
    /// everything else degrades to fewer (or no) actions.
    pub async fn dispatch_step_actions(
        &self,
        transaction_id: &str,
        step: FunnelStep,
        confirmation: &Value,
        request: &RequestContext,
    ) -> FunnelResult<DispatchResult> {
        if transaction_id.trim().is_empty() {
            return Err(FunnelError::InvalidInput("transactionId is required".into()));
        }
        metrics::counter!("dispatch.requests").increment(1);

        let mut state = match self.states.load(transaction_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                warn!(transaction_id, step = %step, "Transaction not found, no actions fired");
                metrics::counter!("dispatch.not_found").increment(1);
                return Ok(DispatchResult::empty());
            }
            Err(e) => {
                error!(transaction_id, step = %step, error = %e, "Transaction state unavailable, no actions fired");
                return Ok(DispatchResult::empty());
            }
        };

        if state.site_id.is_empty() {
            error!(transaction_id, step = %step, "Transaction state has no siteId, no actions fired");
            return Ok(DispatchResult::empty());
        }

        if state.is_step_processed(step) {
            debug!(transaction_id, step = %step, "Step already processed");
            metrics::counter!("dispatch.duplicate").increment(1);
            return Ok(DispatchResult::empty());
        }

        // Atomic claim closes the window between the flag read above and the flag write below
        match self.states.claim_step(transaction_id, step).await {
            Ok(true) => {}
            Ok(false) => {
                info!(transaction_id, step = %step, "Step claimed by a concurrent request");
                metrics::counter!("dispatch.duplicate").increment(1);
                return Ok(DispatchResult::empty());
            }
            Err(e) => {
                error!(transaction_id, step = %step, error = %e, "Could not claim step, no actions fired");
                return Ok(DispatchResult::empty());
            }
        }

        let now = Utc::now();
        state.mark_step_processed(step, now);
        let states = self.states.clone();
        let txn_id = state.id.clone();
        // Only the flag is written; other fields come from the record as stored at write time
        self.tasks.spawn("state_mark_processed", async move {
            match states.update(&txn_id, |s| s.mark_step_processed(step, now)).await {
                Ok(Some(_)) => {}
                Ok(None) => warn!(transaction_id = %txn_id, step = %step, "Transaction vanished before processed flag was written"),
                Err(e) => error!(transaction_id = %txn_id, step = %step, error = %e, "Failed to persist processed flag"),
            }
        });

        let affiliate_id = request.affiliate_id.as_deref().unwrap_or_default();
        let action_keys = self
            .catalog
            .list_action_keys(&state.site_id, step, affiliate_id, state.scrub_decision.is_scrub)
            .await;
        if action_keys.is_empty() {
            debug!(transaction_id, step = %step, "No actions configured");
            return Ok(DispatchResult::empty());
        }

        let definitions = futures::future::join_all(
            action_keys
                .iter()
                .map(|key| self.catalog.get_action_definition(&state.site_id, key)),
        )
        .await;

        let sources = TemplateSources {
            state: &state,
            step,
            confirmation,
            request,
            env: &self.env,
            now,
        };

        let mut client_side_actions = Vec::new();
        for (action_key, definition) in action_keys.iter().zip(definitions) {
            let Some(definition) = definition else {
                warn!(transaction_id, step = %step, action_key = %action_key, "Action definition missing, skipping");
                continue;
            };

            match definition {
                ActionDefinition::ServerSide(action) => match self.prepare_server_request(&action, &sources) {
                    Ok(outbound) => self.fire_server_action(transaction_id, step, action_key, outbound),
                    Err(e) => warn!(
                        transaction_id,
                        step = %step,
                        action_key = %action_key,
                        error = %e,
                        "Server-side action could not be resolved, skipping"
                    ),
                },
                ActionDefinition::ClientSide(action) => {
                    if let Some(script) = self.resolve_client_action(&action, &sources) {
                        client_side_actions.push(script);
                    }
                }
            }
        }

        metrics::counter!("dispatch.client_actions").increment(client_side_actions.len() as u64);
        info!(
            transaction_id,
            step = %step,
            configured = action_keys.len(),
            client_side = client_side_actions.len(),
            "Step actions dispatched"
        );

        Ok(DispatchResult { client_side_actions })
    }

    fn resolve_client_action(&self, action: &ClientSideAction, sources: &TemplateSources<'_>) -> Option<String> {
        let script = self.resolver.resolve_str(&action.script_template, sources);
        (!script.trim().is_empty()).then_some(script)
    }

    /// Resolve url, method, headers and body independently into a concrete request.
    fn prepare_server_request(
        &self,
        action: &ServerSideAction,
        sources: &TemplateSources<'_>,
    ) -> FunnelResult<OutboundRequest> {
        let url = self.resolver.resolve_str(&action.url, sources).trim().to_string();
        url::Url::parse(&url).map_err(|e| FunnelError::Template(format!("resolved url '{url}' is invalid: {e}")))?;

        let method = self.resolver.resolve_str(&action.method, sources).trim().to_ascii_uppercase();
        let method = if method.is_empty() { "POST".to_string() } else { method };
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(FunnelError::Template(format!("unsupported HTTP method '{method}'")));
        }

        let headers = match &action.headers {
            None => Vec::new(),
            Some(template) => resolve_headers(self.resolver.resolve(template, sources))?,
        };

        let body = match &action.body_template {
            _ if method == "GET" => None,
            None => None,
            Some(template) => match self.resolver.resolve(template, sources) {
                Value::Null => None,
                Value::String(text) => Some(OutboundBody::Text(text)),
                json => Some(OutboundBody::Json(json)),
            },
        };

        Ok(OutboundRequest {
            method,
            url,
            headers,
            body,
        })
    }

    /// Launch the webhook as detached work; its outcome only reaches the logs.
    fn fire_server_action(&self, transaction_id: &str, step: FunnelStep, action_key: &str, outbound: OutboundRequest) {
        metrics::counter!("dispatch.server_actions").increment(1);
        let transport = self.transport.clone();
        let timeout = self.action_timeout;
        let transaction_id = transaction_id.to_string();
        let action_key = action_key.to_string();

        self.tasks.spawn("server_action", async move {
            let url = outbound.url.clone();
            match tokio::time::timeout(timeout, transport.send(outbound)).await {
                Ok(Ok(status)) if (200..300).contains(&status) => {
                    debug!(transaction_id = %transaction_id, step = %step, action_key = %action_key, status, "Server-side action delivered");
                }
                Ok(Ok(status)) => {
                    metrics::counter!("dispatch.server_failures").increment(1);
                    warn!(transaction_id = %transaction_id, step = %step, action_key = %action_key, url = %url, status, "Server-side action rejected");
                }
                Ok(Err(e)) => {
                    metrics::counter!("dispatch.server_failures").increment(1);
                    warn!(transaction_id = %transaction_id, step = %step, action_key = %action_key, url = %url, error = %e, "Server-side action failed");
                }
                Err(_) => {
                    metrics::counter!("dispatch.server_failures").increment(1);
                    warn!(
                        transaction_id = %transaction_id,
                        step = %step,
                        action_key = %action_key,
                        url = %url,
                        timeout_ms = timeout.as_millis() as u64,
                        "Server-side action timed out"
                    );
                }
            }
        });
    }
}

/// Headers must resolve to an object of scalars; empty values are dropped.
fn resolve_headers(resolved: Value) -> FunnelResult<Vec<(String, String)>> {
    let Value::Object(fields) = resolved else {
        return Err(FunnelError::Template("headers must be a JSON object".into()));
    };
    let mut headers = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => continue,
            _ => return Err(FunnelError::Template(format!("header '{name}' must be a scalar"))),
        };
        if !value.is_empty() {
            headers.push((name, value));
        }
    }
    Ok(headers)
}
