//! Typed, versioned workflow context.
//!
//! Each workflow kind owns one context struct. Steps read the fields they
//! need and return an updated copy; the executor persists it with the step's
//! outcome so a replayed instance sees exactly what the next step saw.

use std::fmt;

use common::AggregateId;
use domain::{
    Aggregate, CustomerId, Money, Order, OrderItem, OrderStatus, PaymentStatus, ProductId,
    TenantId, VendorId,
};
use payments::ProviderId;
use serde::{Deserialize, Serialize};

use crate::error::{SagaError, StepError};

pub const FULFILLMENT_SCHEMA_VERSION: u32 = 1;
pub const REFUND_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    OrderFulfillment,
    Refund,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::OrderFulfillment => "order_fulfillment",
            ContextKind::Refund => "refund",
        }
    }

    /// Highest schema version this build understands.
    pub fn current_schema(&self) -> u32 {
        match self {
            ContextKind::OrderFulfillment => FULFILLMENT_SCHEMA_VERSION,
            ContextKind::Refund => REFUND_SCHEMA_VERSION,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "workflow", rename_all = "snake_case")]
pub enum WorkflowContext {
    OrderFulfillment(FulfillmentContext),
    Refund(RefundContext),
}

impl WorkflowContext {
    pub fn kind(&self) -> ContextKind {
        match self {
            WorkflowContext::OrderFulfillment(_) => ContextKind::OrderFulfillment,
            WorkflowContext::Refund(_) => ContextKind::Refund,
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            WorkflowContext::OrderFulfillment(ctx) => ctx.schema_version,
            WorkflowContext::Refund(ctx) => ctx.schema_version,
        }
    }

    pub fn order_id(&self) -> AggregateId {
        match self {
            WorkflowContext::OrderFulfillment(ctx) => ctx.order_id,
            WorkflowContext::Refund(ctx) => ctx.order_id,
        }
    }

    /// Rejects schema versions this build cannot interpret.
    pub fn validate(&self) -> Result<(), SagaError> {
        let kind = self.kind();
        let version = self.schema_version();
        if version == 0 || version > kind.current_schema() {
            return Err(SagaError::UnsupportedSchema { kind, version });
        }
        Ok(())
    }

    pub fn fulfillment(&self) -> Result<&FulfillmentContext, StepError> {
        match self {
            WorkflowContext::OrderFulfillment(ctx) => Ok(ctx),
            other => Err(wrong_context(ContextKind::OrderFulfillment, other.kind())),
        }
    }

    pub fn refund(&self) -> Result<&RefundContext, StepError> {
        match self {
            WorkflowContext::Refund(ctx) => Ok(ctx),
            other => Err(wrong_context(ContextKind::Refund, other.kind())),
        }
    }
}

fn wrong_context(expected: ContextKind, actual: ContextKind) -> StepError {
    StepError::permanent(
        "CONTEXT_MISMATCH",
        format!("expected {expected} context, got {actual}"),
    )
}

impl From<FulfillmentContext> for WorkflowContext {
    fn from(ctx: FulfillmentContext) -> Self {
        WorkflowContext::OrderFulfillment(ctx)
    }
}

impl From<RefundContext> for WorkflowContext {
    fn from(ctx: RefundContext) -> Self {
        WorkflowContext::Refund(ctx)
    }
}

/// Quantity held for one product by the reserve step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentContext {
    pub schema_version: u32,
    pub order_id: AggregateId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub vendor_id: VendorId,
    pub items: Vec<OrderItem>,
    pub amount: Money,
    pub currency: String,
    pub provider: ProviderId,
    #[serde(default)]
    pub reservations: Vec<ReservedLine>,
    pub payment_reference: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub delivery_id: Option<String>,
    pub driver_id: Option<String>,
    pub settlement_id: Option<String>,
    pub provider_refund_id: Option<String>,
}

impl FulfillmentContext {
    /// Builds the context for a freshly placed order.
    pub fn from_order(order: &Order, provider: ProviderId) -> Result<Self, SagaError> {
        let order_id = order
            .id()
            .ok_or_else(|| SagaError::InvalidContext("order has not been placed".to_string()))?;
        if order.status() != OrderStatus::Pending {
            return Err(SagaError::InvalidContext(format!(
                "order {order_id} is {}, expected PENDING",
                order.status()
            )));
        }
        let missing = |what: &str| SagaError::InvalidContext(format!("order {order_id} has no {what}"));

        Ok(Self {
            schema_version: FULFILLMENT_SCHEMA_VERSION,
            order_id,
            tenant_id: order.tenant_id().cloned().ok_or_else(|| missing("tenant"))?,
            customer_id: order.customer_id().ok_or_else(|| missing("customer"))?,
            vendor_id: order.vendor_id().ok_or_else(|| missing("vendor"))?,
            items: order.items().to_vec(),
            amount: order.total_amount(),
            currency: order.currency().to_string(),
            provider,
            reservations: Vec::new(),
            payment_reference: None,
            provider_transaction_id: None,
            delivery_id: None,
            driver_id: None,
            settlement_id: None,
            provider_refund_id: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundContext {
    pub schema_version: u32,
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub payment_reference: String,
    pub provider_refund_id: Option<String>,
}

impl RefundContext {
    /// Full refund of a delivered or cancelled order that was paid and has
    /// not been refunded yet.
    pub fn for_order(order: &Order) -> Result<Self, SagaError> {
        let order_id = order
            .id()
            .ok_or_else(|| SagaError::InvalidContext("order has not been placed".to_string()))?;
        if !matches!(order.status(), OrderStatus::Delivered | OrderStatus::Cancelled) {
            return Err(SagaError::InvalidContext(format!(
                "order {order_id} is {}; only delivered or cancelled orders are refunded",
                order.status()
            )));
        }
        if order.payment_status() != PaymentStatus::Paid {
            return Err(SagaError::InvalidContext(format!(
                "order {order_id} payment is {}",
                order.payment_status()
            )));
        }
        if order.refund().is_some() {
            return Err(SagaError::InvalidContext(format!(
                "order {order_id} already has a refund"
            )));
        }
        let payment_reference = order
            .payment_reference()
            .ok_or_else(|| {
                SagaError::InvalidContext(format!("order {order_id} has no payment reference"))
            })?
            .to_string();
        let customer_id = order.customer_id().ok_or_else(|| {
            SagaError::InvalidContext(format!("order {order_id} has no customer"))
        })?;

        Ok(Self {
            schema_version: REFUND_SCHEMA_VERSION,
            order_id,
            customer_id,
            amount: order.total_amount(),
            payment_reference,
            provider_refund_id: None,
        })
    }
}
