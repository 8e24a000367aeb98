//! Domain layer: aggregate traits, command handling and the Order aggregate
//! with its state machine.

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::DomainError;
pub use order::{
    CompleteRefund, CustomerId, DEFAULT_WRITE_ATTEMPTS, Money, Order, OrderError, OrderEvent,
    OrderItem, OrderService, OrderStatus, OrderTrigger, ParseMoneyError, PaymentStatus,
    PlaceOrder, ProductId, RecordPayment, Refund, RefundStatus, RequestRefund, TRANSITIONS,
    TenantId, UpdateStatus, VendorId,
};
