//! Order commands.

use common::AggregateId;
use event_store::Version;

use crate::command::Command;

use super::{CustomerId, Money, Order, OrderItem, OrderTrigger, PaymentStatus, TenantId, VendorId};

/// Command to place a new order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_id: AggregateId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub vendor_id: VendorId,
    pub items: Vec<OrderItem>,
    pub currency: String,
}

impl PlaceOrder {
    /// Creates a PlaceOrder command with a generated order ID.
    pub fn new(
        tenant_id: TenantId,
        customer_id: CustomerId,
        vendor_id: VendorId,
        items: Vec<OrderItem>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            order_id: AggregateId::new(),
            tenant_id,
            customer_id,
            vendor_id,
            items,
            currency: currency.into(),
        }
    }
}

impl Command for PlaceOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

/// Versioned status change, e.g. a vendor marking an order ready.
///
/// Rejected with a concurrency conflict if the order has moved past
/// `expected_version`.
#[derive(Debug, Clone)]
pub struct UpdateStatus {
    pub order_id: AggregateId,
    pub expected_version: Version,
    pub trigger: OrderTrigger,
    pub reason: Option<String>,
}

impl UpdateStatus {
    pub fn new(order_id: AggregateId, expected_version: Version, trigger: OrderTrigger) -> Self {
        Self {
            order_id,
            expected_version,
            trigger,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl Command for UpdateStatus {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub order_id: AggregateId,
    pub status: PaymentStatus,
    pub reference: Option<String>,
}

impl RecordPayment {
    pub fn new(order_id: AggregateId, status: PaymentStatus, reference: Option<String>) -> Self {
        Self {
            order_id,
            status,
            reference,
        }
    }
}

impl Command for RecordPayment {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

#[derive(Debug, Clone)]
pub struct RequestRefund {
    pub order_id: AggregateId,
    pub amount: Money,
}

impl RequestRefund {
    pub fn new(order_id: AggregateId, amount: Money) -> Self {
        Self { order_id, amount }
    }
}

impl Command for RequestRefund {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

#[derive(Debug, Clone)]
pub struct CompleteRefund {
    pub order_id: AggregateId,
    pub provider_refund_id: Option<String>,
}

impl CompleteRefund {
    pub fn new(order_id: AggregateId, provider_refund_id: Option<String>) -> Self {
        Self {
            order_id,
            provider_refund_id,
        }
    }
}

impl Command for CompleteRefund {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_order_generates_id() {
        let a = PlaceOrder::new(TenantId::new("t"), CustomerId::new(), VendorId::new(), vec![], "USD");
        let b = PlaceOrder::new(TenantId::new("t"), CustomerId::new(), VendorId::new(), vec![], "USD");
        assert_ne!(a.aggregate_id(), b.aggregate_id());
    }

    #[test]
    fn test_update_status_with_reason() {
        let order_id = AggregateId::new();
        let cmd = UpdateStatus::new(order_id, Version::new(3), OrderTrigger::Cancel)
            .with_reason("VENDOR_CLOSED");
        assert_eq!(cmd.aggregate_id(), order_id);
        assert_eq!(cmd.reason.as_deref(), Some("VENDOR_CLOSED"));
    }
}
