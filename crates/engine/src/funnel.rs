//! Checkout and upsell processing: charge through the payment gateway, record
//! the outcome on the transaction, then dispatch the step's actions.

use chrono::Utc;
use funnel_core::types::{FunnelStep, RequestContext, TransactionState, TransactionStatus};
use funnel_core::{FunnelError, FunnelResult};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatcher::ActionDispatcher;
use crate::gateway::{confirmation_or_default, PaymentGateway, PaymentRequest};
use crate::state::TransactionStore;

/// What the caller of a checkout/upsell step gets back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub client_side_actions: Vec<String>,
}

pub struct FunnelService {
    states: Arc<TransactionStore>,
    dispatcher: Arc<ActionDispatcher>,
    gateway: Arc<dyn PaymentGateway>,
}

impl FunnelService {
    pub fn new(
        states: Arc<TransactionStore>,
        dispatcher: Arc<ActionDispatcher>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            states,
            dispatcher,
            gateway,
        }
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub async fn process_checkout(
        &self,
        transaction_id: &str,
        payment: Value,
        request: &RequestContext,
    ) -> FunnelResult<StepOutcome> {
        self.process_step(transaction_id, FunnelStep::Initial, payment, request)
            .await
    }

    pub async fn process_upsell(
        &self,
        transaction_id: &str,
        upsell: u32,
        payment: Value,
        request: &RequestContext,
    ) -> FunnelResult<StepOutcome> {
        if upsell == 0 {
            return Err(FunnelError::InvalidInput("upsell number starts at 1".into()));
        }
        self.process_step(transaction_id, FunnelStep::Upsell(upsell), payment, request)
            .await
    }

    /// Look up a transaction for inspection.
    pub async fn transaction(&self, transaction_id: &str) -> FunnelResult<Option<TransactionState>> {
        self.states.load(transaction_id).await
    }

    async fn process_step(
        &self,
        transaction_id: &str,
        step: FunnelStep,
        payment: Value,
        request: &RequestContext,
    ) -> FunnelResult<StepOutcome> {
        let transaction_id = transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(FunnelError::InvalidInput("transactionId is required".into()));
        }
        if !payment.is_object() {
            return Err(FunnelError::InvalidInput("payment must be a JSON object".into()));
        }

        match self.states.load(transaction_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(transaction_id, step = %step, "Charging without transaction state; actions will not fire")
            }
            Err(e) => error!(transaction_id, step = %step, error = %e, "Transaction state unavailable"),
        }

        if step.is_upsell() {
            self.persist(transaction_id, |s| {
                s.set_status(TransactionStatus::UpsellAttempted, Utc::now())
            })
            .await;
        }

        let payment_request = PaymentRequest {
            transaction_id: transaction_id.to_string(),
            step,
            payment,
        };
        let outcome = match self.gateway.charge(&payment_request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(transaction_id, step = %step, error = %e, "Payment gateway call failed");
                let message = e.to_string();
                self.persist(transaction_id, |s| {
                    let now = Utc::now();
                    s.record_error(step, message, now);
                    s.set_status(TransactionStatus::Error, now);
                })
                .await;
                return Ok(StepOutcome {
                    success: false,
                    message: Some("payment processing error".into()),
                    ..Default::default()
                });
            }
        };

        if let Some(redirect_url) = outcome.redirect_url.clone() {
            info!(transaction_id, step = %step, "Payment requires off-site redirect");
            self.persist(transaction_id, |s| {
                s.set_status(TransactionStatus::PaypalRedirect, Utc::now())
            })
            .await;
            return Ok(StepOutcome {
                success: false,
                redirect_url: Some(redirect_url),
                message: outcome.message,
                ..Default::default()
            });
        }

        if !outcome.success {
            let message = outcome
                .message
                .clone()
                .unwrap_or_else(|| "payment declined".to_string());
            warn!(transaction_id, step = %step, reason = %message, "Payment declined");
            let recorded = message.clone();
            self.persist(transaction_id, |s| {
                let now = Utc::now();
                s.record_error(step, recorded, now);
                if step == FunnelStep::Initial {
                    s.set_status(TransactionStatus::Failed, now);
                }
            })
            .await;
            return Ok(StepOutcome {
                success: false,
                order_id: outcome.order_id,
                message: Some(message),
                ..Default::default()
            });
        }

        let order_id = outcome.order_id.clone();
        let status = if step.is_upsell() {
            TransactionStatus::UpsellProcessed
        } else {
            TransactionStatus::Processed
        };
        // Awaited so the dispatcher reads the recorded order id
        self.persist(transaction_id, |s| {
            let now = Utc::now();
            if let Some(order_id) = order_id {
                s.record_order(step, order_id, now);
            }
            s.set_status(status, now);
        })
        .await;

        let confirmation = confirmation_or_default(&outcome);
        let dispatched = self
            .dispatcher
            .dispatch_step_actions(transaction_id, step, &confirmation, request)
            .await?;

        info!(
            transaction_id,
            step = %step,
            order_id = outcome.order_id.as_deref().unwrap_or_default(),
            client_side = dispatched.client_side_actions.len(),
            "Payment step completed"
        );

        Ok(StepOutcome {
            success: true,
            order_id: outcome.order_id,
            redirect_url: None,
            message: None,
            client_side_actions: dispatched.client_side_actions,
        })
    }

    /// Apply `apply` to the stored record; a missing record is left alone.
    async fn persist<F>(&self, transaction_id: &str, apply: F)
    where
        F: FnOnce(&mut TransactionState) + Send,
    {
        if let Err(e) = self.states.update(transaction_id, apply).await {
            error!(transaction_id, error = %e, "Failed to persist transaction state");
        }
    }
}
