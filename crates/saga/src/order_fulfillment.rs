//! Order fulfillment workflow.
//!
//! ```text
//! reserve_inventory ─► charge_payment ─► notify_vendor ─► assign_delivery ─► settle_funds
//!   (release)            (refund)          │ waits for       (cancel)
//!                          │ waits for     ▼ vendor answer
//!                          ▼ payment webhook
//! ```
//!
//! On completion the customer is told the order is confirmed. On
//! compensation the order is cancelled with the failure code as reason and
//! the customer is told why.

use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    CompleteRefund, DEFAULT_WRITE_ATTEMPTS, OrderService, OrderStatus, OrderTrigger,
    PaymentStatus, RecordPayment, RefundStatus, RequestRefund,
};
use event_store::EventStore;
use payments::{ChargeRequest, PaymentGateway, PaymentLedger, PaymentRecord};
use serde_json::json;

use crate::config::SagaConfig;
use crate::context::{ContextKind, FulfillmentContext, ReservedLine};
use crate::definition::{StepDescriptor, WorkflowDefinition};
use crate::error::StepError;
use crate::executor::CANCELLED_CODE;
use crate::instance::WorkflowInstance;
use crate::registry::{
    ActionRegistry, CompensationAction, Finalizer, StepAction, StepInput, StepOutcome,
};
use crate::services::{DeliveryService, InventoryService, NotificationService, Recipient};
use crate::signal::{SagaSignal, SignalKind};

pub const WORKFLOW_ID: &str = "order_fulfillment";
pub const WORKFLOW_VERSION: u32 = 1;

pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";
pub const STEP_CHARGE_PAYMENT: &str = "charge_payment";
pub const STEP_NOTIFY_VENDOR: &str = "notify_vendor";
pub const STEP_ASSIGN_DELIVERY: &str = "assign_delivery";
pub const STEP_SETTLE_FUNDS: &str = "settle_funds";

pub const RELEASE_INVENTORY: &str = "release_inventory";
pub const REFUND_PAYMENT: &str = "refund_payment";
pub const CANCEL_DELIVERY: &str = "cancel_delivery";

pub const CONFIRM_ORDER: &str = "confirm_order";
pub const CANCEL_ORDER: &str = "cancel_order";

/// Failure codes that end up as the order's cancellation reason.
pub const PAYMENT_FAILED: &str = "PAYMENT_FAILED";
pub const VENDOR_REJECTED: &str = "VENDOR_REJECTED";

/// Collaborators the fulfillment actions call.
pub struct FulfillmentDeps {
    pub orders: Arc<OrderService<Arc<dyn EventStore>>>,
    pub inventory: Arc<dyn InventoryService>,
    pub notifications: Arc<dyn NotificationService>,
    pub delivery: Arc<dyn DeliveryService>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub ledger: Arc<dyn PaymentLedger>,
}

/// Version 1 of the fulfillment workflow. Every step uses the configured
/// retry policy and step timeout.
pub fn definition(config: &SagaConfig) -> WorkflowDefinition {
    let step = |name: &str| {
        StepDescriptor::new(name, name)
            .with_retry(config.retry.clone())
            .with_timeout(config.step_timeout)
    };

    WorkflowDefinition::new(WORKFLOW_ID, WORKFLOW_VERSION, ContextKind::OrderFulfillment)
        .step(step(STEP_RESERVE_INVENTORY).compensated_by(RELEASE_INVENTORY))
        .step(step(STEP_CHARGE_PAYMENT).compensated_by(REFUND_PAYMENT))
        .step(step(STEP_NOTIFY_VENDOR))
        .step(step(STEP_ASSIGN_DELIVERY).compensated_by(CANCEL_DELIVERY))
        .step(step(STEP_SETTLE_FUNDS))
        .compensation_strategy(config.compensation_strategy)
        .on_completed(CONFIRM_ORDER)
        .on_compensated(CANCEL_ORDER)
}

/// Registers every action [`definition`] names.
pub fn register(actions: &mut ActionRegistry, deps: Arc<FulfillmentDeps>) {
    actions
        .register_step(STEP_RESERVE_INVENTORY, ReserveInventory(deps.clone()))
        .register_step(STEP_CHARGE_PAYMENT, ChargePayment(deps.clone()))
        .register_step(STEP_NOTIFY_VENDOR, NotifyVendor(deps.clone()))
        .register_step(STEP_ASSIGN_DELIVERY, AssignDelivery(deps.clone()))
        .register_step(STEP_SETTLE_FUNDS, SettleFunds(deps.clone()))
        .register_compensation(RELEASE_INVENTORY, ReleaseInventory(deps.clone()))
        .register_compensation(REFUND_PAYMENT, RefundPayment(deps.clone()))
        .register_compensation(CANCEL_DELIVERY, CancelDelivery(deps.clone()))
        .register_finalizer(CONFIRM_ORDER, ConfirmOrder(deps.clone()))
        .register_finalizer(CANCEL_ORDER, CancelOrder(deps));
}

fn unexpected(input: &StepInput<'_>, signal: &SagaSignal) -> StepError {
    StepError::permanent(
        "UNEXPECTED_SIGNAL",
        format!("{} does not accept {}", input.step_name, signal.kind()),
    )
}

fn payment_reference(ctx: &FulfillmentContext) -> Result<&str, StepError> {
    ctx.payment_reference
        .as_deref()
        .ok_or_else(|| StepError::permanent("PAYMENT_NOT_FOUND", "no charge was initiated"))
}

fn instance_context(instance: &WorkflowInstance) -> Result<&FulfillmentContext, StepError> {
    instance
        .context()
        .ok_or_else(|| StepError::permanent("CONTEXT_MISSING", "instance has no context"))?
        .fulfillment()
}

struct ReserveInventory(Arc<FulfillmentDeps>);

#[async_trait]
impl StepAction for ReserveInventory {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let mut ctx = input.context.fulfillment()?.clone();
        let inventory = &self.0.inventory;

        let mut reserved: Vec<ReservedLine> = Vec::with_capacity(ctx.items.len());
        for item in &ctx.items {
            if let Err(error) = inventory.reserve(&item.product_id, item.quantity).await {
                // All or nothing: hand back what this attempt took.
                for line in reserved.iter().rev() {
                    if let Err(release_error) =
                        inventory.release(&line.product_id, line.quantity).await
                    {
                        tracing::error!(
                            product_id = %line.product_id,
                            error = %release_error,
                            "failed to roll back partial reservation"
                        );
                    }
                }
                return Err(error.into());
            }
            reserved.push(ReservedLine {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            });
        }

        let note = format!("reserved {} line(s)", reserved.len());
        ctx.reservations = reserved;
        Ok(StepOutcome::completed_with_note(ctx, note))
    }
}

struct ReleaseInventory(Arc<FulfillmentDeps>);

#[async_trait]
impl CompensationAction for ReleaseInventory {
    async fn compensate(&self, input: StepInput<'_>) -> Result<String, StepError> {
        let ctx = input.context.fulfillment()?;
        for line in &ctx.reservations {
            self.0
                .inventory
                .release(&line.product_id, line.quantity)
                .await?;
        }
        Ok(format!("released {} line(s)", ctx.reservations.len()))
    }
}

struct ChargePayment(Arc<FulfillmentDeps>);

impl ChargePayment {
    /// Records the payment as paid and moves a pending order to CONFIRMED.
    async fn confirm(
        &self,
        ctx: &mut FulfillmentContext,
        reference: &str,
        provider_transaction_id: &str,
    ) -> Result<(), StepError> {
        let orders = &self.0.orders;
        orders
            .record_payment(RecordPayment::new(
                ctx.order_id,
                PaymentStatus::Paid,
                Some(reference.to_string()),
            ))
            .await?;
        orders
            .modify_with_retry(ctx.order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
                if order.status() == OrderStatus::Pending {
                    order.apply_trigger(OrderTrigger::Confirm, None)
                } else {
                    Ok(vec![])
                }
            })
            .await?;
        ctx.provider_transaction_id = Some(provider_transaction_id.to_string());
        Ok(())
    }

    async fn fail(&self, ctx: &FulfillmentContext, reason: &str) -> StepError {
        let recorded = self
            .0
            .orders
            .record_payment(RecordPayment::new(
                ctx.order_id,
                PaymentStatus::Failed,
                ctx.payment_reference.clone(),
            ))
            .await;
        if let Err(error) = recorded {
            tracing::warn!(order_id = %ctx.order_id, %error, "could not record failed payment");
        }
        StepError::permanent(PAYMENT_FAILED, reason)
    }
}

#[async_trait]
impl StepAction for ChargePayment {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let mut ctx = input.context.fulfillment()?.clone();
        let deps = &self.0;

        // Reuse the charge of an earlier attempt of this instance.
        let record = match deps.ledger.find_by_order(ctx.order_id).await? {
            Some(record) if record.correlation_id == Some(input.instance_id) => record,
            _ => {
                let record = PaymentRecord::pending(
                    PaymentRecord::new_reference(),
                    ctx.order_id,
                    ctx.provider,
                    ctx.amount,
                    ctx.currency.clone(),
                )
                .correlated_with(input.instance_id);
                deps.ledger.record_initiated(record.clone()).await?;
                record
            }
        };
        ctx.payment_reference = Some(record.reference.clone());

        // The verdict may already be in, e.g. when resuming after a restart.
        match record.status {
            PaymentStatus::Paid => {
                let transaction = record.provider_transaction_id.clone().unwrap_or_default();
                self.confirm(&mut ctx, &record.reference, &transaction).await?;
                return Ok(StepOutcome::completed_with_note(ctx, "already paid"));
            }
            PaymentStatus::Failed => {
                let reason = record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "DECLINED".to_string());
                return Err(self.fail(&ctx, &reason).await);
            }
            _ => {}
        }

        let receipt = deps
            .gateway
            .initiate_charge(ChargeRequest {
                reference: record.reference.clone(),
                order_id: ctx.order_id,
                provider: ctx.provider,
                amount: ctx.amount,
                currency: ctx.currency.clone(),
            })
            .await?;
        deps.orders
            .record_payment(RecordPayment::new(
                ctx.order_id,
                PaymentStatus::Pending,
                Some(record.reference.clone()),
            ))
            .await?;

        tracing::info!(
            order_id = %ctx.order_id,
            reference = %record.reference,
            provider = %ctx.provider,
            amount = %ctx.amount,
            "charge initiated"
        );
        ctx.provider_transaction_id = Some(receipt.provider_transaction_id);
        Ok(StepOutcome::pending(ctx, &SignalKind::PAYMENT))
    }

    async fn on_signal(
        &self,
        input: StepInput<'_>,
        signal: &SagaSignal,
    ) -> Result<StepOutcome, StepError> {
        let mut ctx = input.context.fulfillment()?.clone();
        let expected = payment_reference(&ctx)?.to_string();

        let reference = match signal {
            SagaSignal::PaymentSucceeded { reference, .. }
            | SagaSignal::PaymentFailed { reference, .. }
            | SagaSignal::PaymentTimedOut { reference } => reference,
            other => return Err(unexpected(&input, other)),
        };
        if *reference != expected {
            tracing::warn!(%expected, received = %reference, "payment signal for another charge");
            return Ok(StepOutcome::pending(ctx, &SignalKind::PAYMENT));
        }

        match signal {
            SagaSignal::PaymentSucceeded {
                provider_transaction_id,
                amount,
                ..
            } => {
                if *amount != ctx.amount {
                    tracing::warn!(
                        %reference,
                        expected = %ctx.amount,
                        reported = %amount,
                        "paid amount differs from order total"
                    );
                }
                self.confirm(&mut ctx, reference, provider_transaction_id)
                    .await?;
                let note = format!("paid {amount}");
                Ok(StepOutcome::completed_with_note(ctx, note))
            }
            SagaSignal::PaymentFailed { reason, .. } => Err(self.fail(&ctx, reason).await),
            _ => Err(self.fail(&ctx, "TIMEOUT").await),
        }
    }
}

struct RefundPayment(Arc<FulfillmentDeps>);

#[async_trait]
impl CompensationAction for RefundPayment {
    async fn compensate(&self, input: StepInput<'_>) -> Result<String, StepError> {
        let ctx = input.context.fulfillment()?;
        let reference = payment_reference(ctx)?;
        let deps = &self.0;

        let order = deps
            .orders
            .get_order(ctx.order_id)
            .await?
            .ok_or_else(|| StepError::permanent("ORDER_NOT_FOUND", ctx.order_id.to_string()))?;
        match order.refund() {
            Some(refund) if refund.status == RefundStatus::Completed => {
                return Ok("refund already completed".to_string());
            }
            Some(_) => {}
            None => {
                deps.orders
                    .request_refund(RequestRefund::new(ctx.order_id, ctx.amount))
                    .await?;
            }
        }

        let receipt = deps.gateway.refund(reference, ctx.amount).await?;
        deps.ledger
            .mark_refunded(reference, Some(receipt.provider_refund_id.clone()))
            .await?;
        deps.orders
            .complete_refund(CompleteRefund::new(
                ctx.order_id,
                Some(receipt.provider_refund_id.clone()),
            ))
            .await?;

        Ok(format!("refunded {} as {}", ctx.amount, receipt.provider_refund_id))
    }
}

struct NotifyVendor(Arc<FulfillmentDeps>);

#[async_trait]
impl StepAction for NotifyVendor {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let ctx = input.context.fulfillment()?.clone();
        let data = json!({
            "order_id": ctx.order_id,
            "items": ctx.items,
            "total": ctx.amount.to_decimal_string(),
            "currency": ctx.currency,
        });

        // The vendor answers through a signal either way.
        if let Err(error) = self
            .0
            .notifications
            .notify(Recipient::Vendor(ctx.vendor_id), "new_order", data)
            .await
        {
            tracing::warn!(order_id = %ctx.order_id, %error, "vendor notification failed");
        }
        Ok(StepOutcome::pending(ctx, &SignalKind::VENDOR))
    }

    async fn on_signal(
        &self,
        input: StepInput<'_>,
        signal: &SagaSignal,
    ) -> Result<StepOutcome, StepError> {
        let ctx = input.context.fulfillment()?.clone();
        match signal {
            SagaSignal::VendorAccepted => {
                Ok(StepOutcome::completed_with_note(ctx, "vendor accepted"))
            }
            SagaSignal::VendorRejected { reason } => {
                Err(StepError::permanent(VENDOR_REJECTED, reason.clone()))
            }
            other => Err(unexpected(&input, other)),
        }
    }
}

struct AssignDelivery(Arc<FulfillmentDeps>);

#[async_trait]
impl StepAction for AssignDelivery {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let mut ctx = input.context.fulfillment()?.clone();
        let assignment = self.0.delivery.assign(ctx.order_id).await?;

        let note = format!("{} assigned to {}", assignment.delivery_id, assignment.driver_id);
        ctx.delivery_id = Some(assignment.delivery_id);
        ctx.driver_id = Some(assignment.driver_id);
        Ok(StepOutcome::completed_with_note(ctx, note))
    }
}

struct CancelDelivery(Arc<FulfillmentDeps>);

#[async_trait]
impl CompensationAction for CancelDelivery {
    async fn compensate(&self, input: StepInput<'_>) -> Result<String, StepError> {
        let ctx = input.context.fulfillment()?;
        match &ctx.delivery_id {
            Some(delivery_id) => {
                self.0.delivery.cancel_assignment(delivery_id).await?;
                Ok(format!("cancelled {delivery_id}"))
            }
            None => Ok("no delivery assigned".to_string()),
        }
    }
}

struct SettleFunds(Arc<FulfillmentDeps>);

#[async_trait]
impl StepAction for SettleFunds {
    async fn execute(&self, input: StepInput<'_>) -> Result<StepOutcome, StepError> {
        let mut ctx = input.context.fulfillment()?.clone();
        let reference = payment_reference(&ctx)?.to_string();

        let receipt = self
            .0
            .gateway
            .settle(&reference, ctx.vendor_id, ctx.amount)
            .await?;

        let note = format!("settled {} as {}", ctx.amount, receipt.settlement_id);
        ctx.settlement_id = Some(receipt.settlement_id);
        Ok(StepOutcome::completed_with_note(ctx, note))
    }
}

struct ConfirmOrder(Arc<FulfillmentDeps>);

#[async_trait]
impl Finalizer for ConfirmOrder {
    async fn finalize(&self, instance: &WorkflowInstance) -> Result<(), StepError> {
        let ctx = instance_context(instance)?;
        let data = json!({
            "order_id": ctx.order_id,
            "total": ctx.amount.to_decimal_string(),
            "delivery_id": ctx.delivery_id,
        });
        self.0
            .notifications
            .notify(Recipient::Customer(ctx.customer_id), "order_confirmed", data)
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }
}

struct CancelOrder(Arc<FulfillmentDeps>);

#[async_trait]
impl Finalizer for CancelOrder {
    async fn finalize(&self, instance: &WorkflowInstance) -> Result<(), StepError> {
        let ctx = instance_context(instance)?;
        let reason = instance
            .failure()
            .map(|failure| failure.code.clone())
            .unwrap_or_else(|| CANCELLED_CODE.to_string());

        let result = self
            .0
            .orders
            .modify_with_retry(ctx.order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
                if order.status().can_transition(OrderTrigger::Cancel) {
                    order.apply_trigger(OrderTrigger::Cancel, Some(reason.clone()))
                } else {
                    Ok(vec![])
                }
            })
            .await?;
        tracing::info!(
            order_id = %ctx.order_id,
            status = %result.aggregate.status(),
            %reason,
            "order cancelled after compensation"
        );

        let data = json!({ "order_id": ctx.order_id, "reason": reason });
        self.0
            .notifications
            .notify(Recipient::Customer(ctx.customer_id), "order_cancelled", data)
            .await
            .map_err(|e| StepError::transient(e.to_string()))?;
        Ok(())
    }
}
