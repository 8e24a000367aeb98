//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod state;
mod value_objects;

pub use aggregate::{Order, Refund};
pub use commands::*;
pub use events::{
    OrderEvent, OrderPlacedData, PaymentRecordedData, RefundCompletedData, RefundRequestedData,
    StatusChangedData,
};
pub use service::{DEFAULT_WRITE_ATTEMPTS, OrderService};
pub use state::{OrderStatus, OrderTrigger, PaymentStatus, RefundStatus, TRANSITIONS};
pub use value_objects::{
    CustomerId, Money, OrderItem, ParseMoneyError, ProductId, TenantId, VendorId,
};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The `(status, trigger)` pair is not in the transition table.
    #[error("Invalid transition: {trigger} is not allowed from {from}")]
    InvalidTransition {
        from: OrderStatus,
        trigger: OrderTrigger,
    },

    #[error("Invalid payment transition: {from} -> {to}")]
    InvalidPaymentTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Order already placed")]
    AlreadyPlaced,

    #[error("Order has not been placed")]
    NotPlaced,

    #[error("Order has no items")]
    NoItems,

    #[error("Invalid quantity for {product_id}: must be greater than 0")]
    InvalidQuantity { product_id: String },

    #[error("Invalid price for {product_id}: {price}")]
    InvalidPrice { product_id: String, price: Money },

    #[error("Order is not paid (payment status {0})")]
    NotPaid(PaymentStatus),

    #[error("A refund was already requested for this order")]
    RefundAlreadyRequested,

    #[error("No refund is pending for this order")]
    NoRefundPending,

    #[error("Invalid refund amount {amount} for order total {total}")]
    InvalidRefundAmount { amount: Money, total: Money },

    /// A line or order total does not fit in the amount type.
    #[error("Amount overflow in {}", .product_id.as_deref().unwrap_or("order total"))]
    AmountOverflow { product_id: Option<String> },
}
