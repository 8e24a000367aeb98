//! Order domain events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{
    CustomerId, Money, OrderError, OrderItem, OrderStatus, OrderTrigger, PaymentStatus, TenantId,
    VendorId,
};

/// Events that can occur on an order aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Order was placed by a customer.
    OrderPlaced(OrderPlacedData),

    /// The state machine moved the order to a new status.
    StatusChanged(StatusChangedData),

    /// Payment status changed.
    PaymentRecorded(PaymentRecordedData),

    /// A refund was issued at the gateway and is awaiting confirmation.
    RefundRequested(RefundRequestedData),

    /// The gateway confirmed the refund.
    RefundCompleted(RefundCompletedData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "OrderPlaced",
            OrderEvent::StatusChanged(_) => "OrderStatusChanged",
            OrderEvent::PaymentRecorded(_) => "OrderPaymentRecorded",
            OrderEvent::RefundRequested(_) => "OrderRefundRequested",
            OrderEvent::RefundCompleted(_) => "OrderRefundCompleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: AggregateId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub vendor_id: VendorId,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    /// ISO 4217 code, e.g. `"USD"`.
    pub currency: String,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedData {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub trigger: OrderTrigger,
    /// Reason code, e.g. `"PAYMENT_FAILED"` on cancellation.
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecordedData {
    pub status: PaymentStatus,
    /// Gateway-side payment reference.
    pub reference: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequestedData {
    pub amount: Money,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundCompletedData {
    pub provider_refund_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl OrderEvent {
    pub fn order_placed(
        order_id: AggregateId,
        tenant_id: TenantId,
        customer_id: CustomerId,
        vendor_id: VendorId,
        items: Vec<OrderItem>,
        currency: impl Into<String>,
    ) -> Result<Self, OrderError> {
        let total_amount = OrderItem::total_of(&items)?;
        Ok(OrderEvent::OrderPlaced(OrderPlacedData {
            order_id,
            tenant_id,
            customer_id,
            vendor_id,
            items,
            total_amount,
            currency: currency.into(),
            placed_at: Utc::now(),
        }))
    }

    pub fn status_changed(
        from: OrderStatus,
        to: OrderStatus,
        trigger: OrderTrigger,
        reason: Option<String>,
    ) -> Self {
        OrderEvent::StatusChanged(StatusChangedData {
            from,
            to,
            trigger,
            reason,
            changed_at: Utc::now(),
        })
    }

    pub fn payment_recorded(status: PaymentStatus, reference: Option<String>) -> Self {
        OrderEvent::PaymentRecorded(PaymentRecordedData {
            status,
            reference,
            recorded_at: Utc::now(),
        })
    }

    pub fn refund_requested(amount: Money) -> Self {
        OrderEvent::RefundRequested(RefundRequestedData {
            amount,
            requested_at: Utc::now(),
        })
    }

    pub fn refund_completed(provider_refund_id: Option<String>) -> Self {
        OrderEvent::RefundCompleted(RefundCompletedData {
            provider_refund_id,
            completed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed() -> OrderEvent {
        OrderEvent::order_placed(
            AggregateId::new(),
            TenantId::new("harare-eats"),
            CustomerId::new(),
            VendorId::new(),
            vec![
                OrderItem::new("SKU-001", "Burger", 1, Money::from_cents(1500)),
                OrderItem::new("SKU-002", "Chips", 2, Money::from_cents(425)),
            ],
            "USD",
        )
        .unwrap()
    }

    #[test]
    fn test_event_type() {
        assert_eq!(placed().event_type(), "OrderPlaced");
        assert_eq!(
            OrderEvent::status_changed(
                OrderStatus::Pending,
                OrderStatus::Confirmed,
                OrderTrigger::Confirm,
                None
            )
            .event_type(),
            "OrderStatusChanged"
        );
        assert_eq!(
            OrderEvent::payment_recorded(PaymentStatus::Paid, None).event_type(),
            "OrderPaymentRecorded"
        );
        assert_eq!(
            OrderEvent::refund_requested(Money::from_cents(1)).event_type(),
            "OrderRefundRequested"
        );
        assert_eq!(
            OrderEvent::refund_completed(None).event_type(),
            "OrderRefundCompleted"
        );
    }

    #[test]
    fn test_placed_computes_total() {
        let OrderEvent::OrderPlaced(data) = placed() else {
            panic!("Expected OrderPlaced event");
        };
        assert_eq!(data.total_amount.cents(), 2350);
    }

    #[test]
    fn test_event_serialization() {
        let event = OrderEvent::status_changed(
            OrderStatus::Pending,
            OrderStatus::Cancelled,
            OrderTrigger::Cancel,
            Some("PAYMENT_FAILED".to_string()),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StatusChanged");
        assert_eq!(json["data"]["to"], "CANCELLED");

        let deserialized: OrderEvent = serde_json::from_value(json).unwrap();
        if let OrderEvent::StatusChanged(data) = deserialized {
            assert_eq!(data.reason.as_deref(), Some("PAYMENT_FAILED"));
        } else {
            panic!("Expected StatusChanged event");
        }
    }
}
