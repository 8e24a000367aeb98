//! Refund workflow for orders that already left the fulfillment path.
//!
//! `issue_refund` asks the gateway to return the money and opens the
//! order's refund; `complete_refund` closes it and moves the order to
//! REFUNDED. A refund that cannot be issued ends compensated with no
//! reversals to run.

use std::sync::Arc;

use async_trait::async_trait;
use domain::{CompleteRefund, DEFAULT_WRITE_ATTEMPTS, OrderTrigger, RequestRefund};
use serde_json::json;

use crate::config::SagaConfig;
use crate::context::{ContextKind, RefundContext};
use crate::definition::{StepDescriptor, WorkflowDefinition};
use crate::error::StepError;
use crate::instance::WorkflowInstance;
use crate::order_fulfillment::FulfillmentDeps;
use crate::registry::{ActionRegistry, Finalizer, StepAction, StepInput, StepOutcome};
use crate::services::Recipient;

pub const WORKFLOW_ID: &str = "refund";
pub const WORKFLOW_VERSION: u32 = 1;

pub const STEP_ISSUE_REFUND: &str = "issue_refund";
pub const STEP_COMPLETE_REFUND: &str = "complete_refund";

pub const NOTIFY_REFUNDED: &str = "notify_refunded";
pub const NOTIFY_REFUND_FAILED: &str = "notify_refund_failed";

pub fn definition(config: &SagaConfig) -> WorkflowDefinition {
    let step = |name: &str| {
        StepDescriptor::new(name, name)
            .with_retry(config.retry.clone())
            .with_timeout(config.step_timeout)
    };

    WorkflowDefinition::new(WORKFLOW_ID, WORKFLOW_VERSION, ContextKind::Refund)
        .step(step(STEP_ISSUE_REFUND))
        .step(step(STEP_COMPLETE_REFUND))
        .on_completed(NOTIFY_REFUNDED)
        .on_compensated(NOTIFY_REFUND_FAILED)
}

/// Registers the refund actions. They share the fulfillment collaborators.
pub fn register(actions: &mut ActionRegistry, deps: Arc<FulfillmentDeps>) {
    actions
        .register_step(STEP_ISSUE_REFUND, IssueRefund(deps.clone()))
        .register_step(STEP_COMPLETE_REFUND, CompleteOrderRefund(deps.clone()))
        .register_finalizer(NOTIFY_REFUNDED, NotifyCustomer::refunded(deps.clone()))
        .register_finalizer(NOTIFY_REFUND_FAILED, NotifyCustomer::failed(deps));
}

struct IssueRefund(Arc<FulfillmentDeps>);

#[async_trait]
impl StepAction for IssueRefund {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let mut ctx = input.context.refund()?.clone();
        if let Some(refund_id) = &ctx.provider_refund_id {
            let note = format!("already issued as {refund_id}");
            return Ok(StepOutcome::completed_with_note(ctx, note));
        }
        let deps = &self.0;

        let order = deps
            .orders
            .get_order(ctx.order_id)
            .await?
            .ok_or_else(|| StepError::permanent("ORDER_NOT_FOUND", ctx.order_id.to_string()))?;
        if order.refund().is_none() {
            deps.orders
                .request_refund(RequestRefund::new(ctx.order_id, ctx.amount))
                .await?;
        }

        let receipt = deps.gateway.refund(&ctx.payment_reference, ctx.amount).await?;
        deps.ledger
            .mark_refunded(&ctx.payment_reference, Some(receipt.provider_refund_id.clone()))
            .await?;

        tracing::info!(
            order_id = %ctx.order_id,
            amount = %ctx.amount,
            refund_id = %receipt.provider_refund_id,
            "refund issued"
        );
        let note = format!("issued {} as {}", ctx.amount, receipt.provider_refund_id);
        ctx.provider_refund_id = Some(receipt.provider_refund_id);
        Ok(StepOutcome::completed_with_note(ctx, note))
    }
}

struct CompleteOrderRefund(Arc<FulfillmentDeps>);

#[async_trait]
impl StepAction for CompleteOrderRefund {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let ctx = input.context.refund()?.clone();
        let orders = &self.0.orders;

        orders
            .complete_refund(CompleteRefund::new(
                ctx.order_id,
                ctx.provider_refund_id.clone(),
            ))
            .await?;

        orders
            .modify_with_retry(ctx.order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
                if order.status().can_transition(OrderTrigger::Refund) {
                    order.apply_trigger(OrderTrigger::Refund, None)
                } else {
                    Ok(vec![])
                }
            })
            .await?;

        Ok(StepOutcome::completed_with_note(ctx, "order refunded"))
    }
}

/// Tells the customer how the refund ended.
struct NotifyCustomer {
    deps: Arc<FulfillmentDeps>,
    event_type: &'static str,
}

impl NotifyCustomer {
    fn refunded(deps: Arc<FulfillmentDeps>) -> Self {
        Self {
            deps,
            event_type: "order_refunded",
        }
    }

    fn failed(deps: Arc<FulfillmentDeps>) -> Self {
        Self {
            deps,
            event_type: "refund_failed",
        }
    }
}

#[async_trait]
impl Finalizer for NotifyCustomer {
    async fn finalize(&self, instance: &WorkflowInstance) -> Result<(), StepError> {
        let ctx: &RefundContext = instance
            .context()
            .ok_or_else(|| StepError::permanent("CONTEXT_MISSING", "instance has no context"))?
            .refund()?;
        let data = json!({
            "order_id": ctx.order_id,
            "amount": ctx.amount.to_decimal_string(),
            "reason": instance.failure().map(|failure| failure.code.clone()),
        });

        self.deps
            .notifications
            .notify(Recipient::Customer(ctx.customer_id), self.event_type, data)
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }
}
