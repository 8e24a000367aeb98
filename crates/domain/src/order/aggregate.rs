//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{
    CustomerId, Money, OrderError, OrderEvent, OrderItem, OrderStatus, OrderTrigger,
    PaymentStatus, RefundStatus, TenantId, VendorId,
    events::{OrderPlacedData, StatusChangedData},
};

/// Refund attached to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub amount: Money,
    pub status: RefundStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub provider_refund_id: Option<String>,
}

/// Order aggregate root.
///
/// Every status change is validated by the order state machine before an
/// event is emitted; `apply` only replays what was already decided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    id: Option<AggregateId>,

    /// Optimistic-concurrency token.
    #[serde(default)]
    version: Version,

    tenant_id: Option<TenantId>,
    customer_id: Option<CustomerId>,
    vendor_id: Option<VendorId>,
    status: OrderStatus,
    items: Vec<OrderItem>,
    total_amount: Money,
    currency: String,
    payment_status: PaymentStatus,
    payment_reference: Option<String>,
    refund: Option<Refund>,
    cancellation_reason: Option<String>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderPlaced(data) => self.apply_order_placed(data),
            OrderEvent::StatusChanged(data) => self.apply_status_changed(data),
            OrderEvent::PaymentRecorded(data) => {
                self.payment_status = data.status;
                if data.reference.is_some() {
                    self.payment_reference = data.reference;
                }
            }
            OrderEvent::RefundRequested(data) => {
                self.refund = Some(Refund {
                    amount: data.amount,
                    status: RefundStatus::Pending,
                    requested_at: data.requested_at,
                    completed_at: None,
                    provider_refund_id: None,
                });
            }
            OrderEvent::RefundCompleted(data) => {
                if let Some(refund) = self.refund.as_mut() {
                    refund.status = RefundStatus::Completed;
                    refund.completed_at = Some(data.completed_at);
                    refund.provider_refund_id = data.provider_refund_id;
                }
                self.payment_status = PaymentStatus::Refunded;
            }
        }
    }
}

// Query methods
impl Order {
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn vendor_id(&self) -> Option<VendorId> {
        self.vendor_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn payment_reference(&self) -> Option<&str> {
        self.payment_reference.as_deref()
    }

    pub fn refund(&self) -> Option<&Refund> {
        self.refund.as_ref()
    }

    /// Reason code recorded when the order was cancelled.
    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    /// Triggers the state machine accepts from the current status.
    pub fn available_transitions(&self) -> Vec<OrderTrigger> {
        self.status.available_transitions()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// Command methods (return events)
impl Order {
    /// Places a new order.
    pub fn place(
        &self,
        order_id: AggregateId,
        tenant_id: TenantId,
        customer_id: CustomerId,
        vendor_id: VendorId,
        items: Vec<OrderItem>,
        currency: impl Into<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyPlaced);
        }
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id.to_string(),
                });
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    product_id: item.product_id.to_string(),
                    price: item.unit_price,
                });
            }
        }

        Ok(vec![OrderEvent::order_placed(
            order_id,
            tenant_id,
            customer_id,
            vendor_id,
            items,
            currency,
        )?])
    }

    /// Moves the order through the state machine.
    pub fn apply_trigger(
        &self,
        trigger: OrderTrigger,
        reason: Option<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        let next = self.status.transition(trigger)?;
        Ok(vec![OrderEvent::status_changed(
            self.status,
            next,
            trigger,
            reason,
        )])
    }

    /// Records a payment status change. Recording the current status again
    /// is a no-op.
    pub fn record_payment(
        &self,
        status: PaymentStatus,
        reference: Option<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if status == self.payment_status {
            return Ok(vec![]);
        }
        if !self.payment_status.can_move_to(status) {
            return Err(OrderError::InvalidPaymentTransition {
                from: self.payment_status,
                to: status,
            });
        }
        Ok(vec![OrderEvent::payment_recorded(status, reference)])
    }

    /// Opens a refund for a paid order.
    pub fn request_refund(&self, amount: Money) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.refund.is_some() {
            return Err(OrderError::RefundAlreadyRequested);
        }
        if self.payment_status != PaymentStatus::Paid {
            return Err(OrderError::NotPaid(self.payment_status));
        }
        if !amount.is_positive() || amount > self.total_amount {
            return Err(OrderError::InvalidRefundAmount {
                amount,
                total: self.total_amount,
            });
        }
        Ok(vec![OrderEvent::refund_requested(amount)])
    }

    /// Marks the pending refund completed. Completing twice is a no-op.
    pub fn complete_refund(
        &self,
        provider_refund_id: Option<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match &self.refund {
            Some(refund) if refund.status == RefundStatus::Completed => Ok(vec![]),
            Some(_) => Ok(vec![OrderEvent::refund_completed(provider_refund_id)]),
            None => Err(OrderError::NoRefundPending),
        }
    }

    fn ensure_placed(&self) -> Result<(), OrderError> {
        if self.id.is_none() {
            return Err(OrderError::NotPlaced);
        }
        Ok(())
    }
}

// Apply event helpers
impl Order {
    fn apply_order_placed(&mut self, data: OrderPlacedData) {
        self.id = Some(data.order_id);
        self.tenant_id = Some(data.tenant_id);
        self.customer_id = Some(data.customer_id);
        self.vendor_id = Some(data.vendor_id);
        self.items = data.items;
        self.total_amount = data.total_amount;
        self.currency = data.currency;
        self.status = OrderStatus::Pending;
        self.payment_status = PaymentStatus::Unpaid;
    }

    fn apply_status_changed(&mut self, data: StatusChangedData) {
        self.status = data.to;
        if data.trigger == OrderTrigger::Cancel {
            self.cancellation_reason = data.reason;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregate, DomainEvent};

    fn place_order() -> Order {
        let mut order = Order::default();
        let events = order
            .place(
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
            .unwrap();
        order.apply_events(events);
        order
    }

    fn apply(order: &mut Order, events: Vec<OrderEvent>) {
        order.apply_events(events);
    }

    #[test]
    fn test_place_order() {
        let order = place_order();
        assert!(order.id().is_some());
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.payment_status(), PaymentStatus::Unpaid);
        assert_eq!(order.total_amount().cents(), 2350);
        assert_eq!(order.items().len(), 2);
        assert_eq!(order.tenant_id().map(TenantId::as_str), Some("harare-eats"));
    }

    #[test]
    fn test_place_twice_fails() {
        let order = place_order();
        let result = order.place(
            AggregateId::new(),
            TenantId::new("t"),
            CustomerId::new(),
            VendorId::new(),
            vec![OrderItem::new("SKU", "x", 1, Money::from_cents(1))],
            "USD",
        );
        assert!(matches!(result, Err(OrderError::AlreadyPlaced)));
    }

    #[test]
    fn test_place_validates_items() {
        let order = Order::default();
        let id = AggregateId::new();
        let tenant = TenantId::new("t");

        let result = order.place(id, tenant.clone(), CustomerId::new(), VendorId::new(), vec![], "USD");
        assert!(matches!(result, Err(OrderError::NoItems)));

        let result = order.place(
            id,
            tenant.clone(),
            CustomerId::new(),
            VendorId::new(),
            vec![OrderItem::new("SKU", "x", 0, Money::from_cents(100))],
            "USD",
        );
        assert!(matches!(result, Err(OrderError::InvalidQuantity { .. })));

        let result = order.place(
            id,
            tenant.clone(),
            CustomerId::new(),
            VendorId::new(),
            vec![OrderItem::new("SKU", "x", 1, Money::zero())],
            "USD",
        );
        assert!(matches!(result, Err(OrderError::InvalidPrice { .. })));

        let result = order.place(
            id,
            tenant,
            CustomerId::new(),
            VendorId::new(),
            vec![OrderItem::new("SKU", "x", 2, Money::from_cents(i64::MAX))],
            "USD",
        );
        assert!(matches!(result, Err(OrderError::AmountOverflow { .. })));
        assert!(order.id().is_none());
    }

    #[test]
    fn test_commands_on_unplaced_order_fail() {
        let order = Order::default();
        assert!(matches!(
            order.apply_trigger(OrderTrigger::Confirm, None),
            Err(OrderError::NotPlaced)
        ));
    }

    #[test]
    fn test_trigger_follows_table() {
        let mut order = place_order();
        let events = order.apply_trigger(OrderTrigger::Confirm, None).unwrap();
        assert_eq!(events[0].event_type(), "OrderStatusChanged");
        apply(&mut order, events);
        assert_eq!(order.status(), OrderStatus::Confirmed);

        let result = order.apply_trigger(OrderTrigger::Deliver, None);
        assert!(matches!(
            result,
            Err(OrderError::InvalidTransition {
                from: OrderStatus::Confirmed,
                trigger: OrderTrigger::Deliver
            })
        ));
        assert_eq!(order.status(), OrderStatus::Confirmed);
    }

    #[test]
    fn test_cancel_records_reason() {
        let mut order = place_order();
        let events = order
            .apply_trigger(OrderTrigger::Cancel, Some("PAYMENT_FAILED".to_string()))
            .unwrap();
        apply(&mut order, events);
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason(), Some("PAYMENT_FAILED"));
        assert_eq!(order.available_transitions(), vec![OrderTrigger::Refund]);
    }

    #[test]
    fn test_record_payment() {
        let mut order = place_order();
        let events = order
            .record_payment(PaymentStatus::Pending, Some("ECO-123".to_string()))
            .unwrap();
        apply(&mut order, events);
        assert_eq!(order.payment_reference(), Some("ECO-123"));

        // Same status again is a no-op.
        assert!(order.record_payment(PaymentStatus::Pending, None).unwrap().is_empty());

        let events = order.record_payment(PaymentStatus::Paid, None).unwrap();
        apply(&mut order, events);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert_eq!(order.payment_reference(), Some("ECO-123"));

        assert!(matches!(
            order.record_payment(PaymentStatus::Failed, None),
            Err(OrderError::InvalidPaymentTransition { .. })
        ));
    }

    #[test]
    fn test_refund_lifecycle() {
        let mut order = place_order();
        assert!(matches!(
            order.request_refund(Money::from_cents(100)),
            Err(OrderError::NotPaid(PaymentStatus::Unpaid))
        ));

        let events = order.record_payment(PaymentStatus::Paid, None).unwrap();
        apply(&mut order, events);

        assert!(matches!(
            order.request_refund(Money::from_cents(5000)),
            Err(OrderError::InvalidRefundAmount { .. })
        ));
        assert!(matches!(
            order.complete_refund(None),
            Err(OrderError::NoRefundPending)
        ));

        let events = order.request_refund(order.total_amount()).unwrap();
        apply(&mut order, events);
        assert_eq!(order.refund().unwrap().status, RefundStatus::Pending);
        assert!(matches!(
            order.request_refund(Money::from_cents(1)),
            Err(OrderError::RefundAlreadyRequested)
        ));

        let events = order.complete_refund(Some("RF-1".to_string())).unwrap();
        apply(&mut order, events);
        let refund = order.refund().unwrap();
        assert_eq!(refund.status, RefundStatus::Completed);
        assert_eq!(refund.amount.cents(), 2350);
        assert!(refund.completed_at.is_some());
        assert_eq!(order.payment_status(), PaymentStatus::Refunded);

        assert!(order.complete_refund(None).unwrap().is_empty());
    }

    #[test]
    fn test_order_serialization() {
        let order = place_order();
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), order.id());
        assert_eq!(back.total_amount(), order.total_amount());
    }
}
