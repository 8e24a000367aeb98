//! Order state machine.
//!
//! ```text
//! Pending ──► Confirmed ──► Preparing ──► Ready ──► OutForDelivery ──► Delivered
//!    │            │             │           │              │               │
//!    │            └─────────────┴───────────┴──► Cancelled │               │
//!    ├──────────────────────────────────────────► Cancelled│               │
//!    └──► Failed ◄─────────────────────────────────────────┘               │
//!                                              Cancelled ──► Refunded ◄────┘
//! ```
//!
//! [`TRANSITIONS`] is the only place legal moves are written down. The
//! transition function and both read-only queries are lookups into it.

use serde::{Deserialize, Serialize};

use super::OrderError;

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed, awaiting payment.
    #[default]
    Pending,
    /// Paid; the fulfillment saga is driving it.
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Cancelled,
    Failed,
    Refunded,
}

/// Events that move an order between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderTrigger {
    Confirm,
    StartPreparing,
    MarkReady,
    PickUp,
    Deliver,
    Cancel,
    Fail,
    Refund,
}

use OrderStatus as S;
use OrderTrigger as T;

/// Every legal `(from, trigger) -> to` move. Pairs missing here are invalid.
pub const TRANSITIONS: &[(OrderStatus, OrderTrigger, OrderStatus)] = &[
    (S::Pending, T::Confirm, S::Confirmed),
    (S::Pending, T::Cancel, S::Cancelled),
    (S::Pending, T::Fail, S::Failed),
    (S::Confirmed, T::StartPreparing, S::Preparing),
    (S::Confirmed, T::Cancel, S::Cancelled),
    (S::Preparing, T::MarkReady, S::Ready),
    (S::Preparing, T::Cancel, S::Cancelled),
    (S::Ready, T::PickUp, S::OutForDelivery),
    (S::Ready, T::Cancel, S::Cancelled),
    (S::OutForDelivery, T::Deliver, S::Delivered),
    (S::OutForDelivery, T::Fail, S::Failed),
    (S::Cancelled, T::Refund, S::Refunded),
    (S::Delivered, T::Refund, S::Refunded),
];

const fn has_duplicate_keys(table: &[(OrderStatus, OrderTrigger, OrderStatus)]) -> bool {
    let mut i = 0;
    while i < table.len() {
        let mut j = i + 1;
        while j < table.len() {
            if table[i].0 as u8 == table[j].0 as u8 && table[i].1 as u8 == table[j].1 as u8 {
                return true;
            }
            j += 1;
        }
        i += 1;
    }
    false
}

const _: () = assert!(
    !has_duplicate_keys(TRANSITIONS),
    "order transition table has two entries for the same (status, trigger)"
);

impl OrderStatus {
    /// Applies a trigger, returning the next status.
    pub fn transition(self, trigger: OrderTrigger) -> Result<OrderStatus, OrderError> {
        TRANSITIONS
            .iter()
            .find(|(from, t, _)| *from == self && *t == trigger)
            .map(|(_, _, to)| *to)
            .ok_or(OrderError::InvalidTransition {
                from: self,
                trigger,
            })
    }

    /// Returns true if `trigger` is legal from this status.
    pub fn can_transition(self, trigger: OrderTrigger) -> bool {
        self.transition(trigger).is_ok()
    }

    /// Triggers accepted from this status, in table order.
    pub fn available_transitions(self) -> Vec<OrderTrigger> {
        TRANSITIONS
            .iter()
            .filter(|(from, _, _)| *from == self)
            .map(|(_, trigger, _)| *trigger)
            .collect()
    }

    /// Returns true once the fulfillment path has ended. Only `Refund` may
    /// follow a terminal status, and only where the table allows it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            S::Delivered | S::Cancelled | S::Failed | S::Refunded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            S::Pending => "PENDING",
            S::Confirmed => "CONFIRMED",
            S::Preparing => "PREPARING",
            S::Ready => "READY",
            S::OutForDelivery => "OUT_FOR_DELIVERY",
            S::Delivered => "DELIVERED",
            S::Cancelled => "CANCELLED",
            S::Failed => "FAILED",
            S::Refunded => "REFUNDED",
        }
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [OrderStatus; 9] = [
        S::Pending,
        S::Confirmed,
        S::Preparing,
        S::Ready,
        S::OutForDelivery,
        S::Delivered,
        S::Cancelled,
        S::Failed,
        S::Refunded,
    ];
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrderTrigger {
    pub const ALL: [OrderTrigger; 8] = [
        T::Confirm,
        T::StartPreparing,
        T::MarkReady,
        T::PickUp,
        T::Deliver,
        T::Cancel,
        T::Fail,
        T::Refund,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            T::Confirm => "CONFIRM",
            T::StartPreparing => "START_PREPARING",
            T::MarkReady => "MARK_READY",
            T::PickUp => "PICK_UP",
            T::Deliver => "DELIVER",
            T::Cancel => "CANCEL",
            T::Fail => "FAIL",
            T::Refund => "REFUND",
        }
    }
}

impl std::fmt::Display for OrderTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the order's money is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    /// A charge was initiated and the gateway has not answered yet.
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Returns true if a payment may move from this status to `next`.
    ///
    /// `Refunded` is only reached by completing a refund, never recorded
    /// directly.
    pub fn can_move_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Unpaid, Pending)
                | (Unpaid, Paid)
                | (Unpaid, Failed)
                | (Pending, Paid)
                | (Pending, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_happy_path() {
        let mut status = OrderStatus::Pending;
        for trigger in [
            T::Confirm,
            T::StartPreparing,
            T::MarkReady,
            T::PickUp,
            T::Deliver,
        ] {
            status = status.transition(trigger).unwrap();
        }
        assert_eq!(status, OrderStatus::Delivered);
        assert_eq!(status.transition(T::Refund).unwrap(), OrderStatus::Refunded);
    }

    #[test]
    fn test_pairs_outside_table_are_rejected() {
        for from in OrderStatus::ALL {
            for trigger in OrderTrigger::ALL {
                let listed = TRANSITIONS
                    .iter()
                    .any(|(f, t, _)| *f == from && *t == trigger);
                let result = from.transition(trigger);
                assert_eq!(result.is_ok(), listed, "{from} --{trigger}");
                if !listed {
                    assert!(matches!(
                        result,
                        Err(OrderError::InvalidTransition { from: f, trigger: t })
                            if f == from && t == trigger
                    ));
                }
            }
        }
    }

    #[test]
    fn test_queries_agree_with_transition() {
        for from in OrderStatus::ALL {
            let available = from.available_transitions();
            for trigger in OrderTrigger::ALL {
                assert_eq!(from.can_transition(trigger), available.contains(&trigger));
                assert_eq!(from.can_transition(trigger), from.transition(trigger).is_ok());
            }
        }
    }

    #[test]
    fn test_terminal_statuses_only_accept_refund() {
        assert!(OrderStatus::Refunded.available_transitions().is_empty());
        assert!(OrderStatus::Failed.available_transitions().is_empty());
        assert_eq!(OrderStatus::Delivered.available_transitions(), vec![T::Refund]);
        assert_eq!(OrderStatus::Cancelled.available_transitions(), vec![T::Refund]);
    }

    #[test]
    fn test_cancel_only_before_pickup() {
        assert!(OrderStatus::Ready.can_transition(T::Cancel));
        assert!(!OrderStatus::OutForDelivery.can_transition(T::Cancel));
        assert!(!OrderStatus::Delivered.can_transition(T::Cancel));
    }

    #[test]
    fn test_duplicate_detection() {
        assert!(!has_duplicate_keys(TRANSITIONS));
        let dup = [
            (S::Pending, T::Confirm, S::Confirmed),
            (S::Pending, T::Confirm, S::Failed),
        ];
        assert!(has_duplicate_keys(&dup));
    }

    #[test]
    fn test_payment_status_moves() {
        assert!(PaymentStatus::Unpaid.can_move_to(PaymentStatus::Pending));
        assert!(PaymentStatus::Pending.can_move_to(PaymentStatus::Paid));
        assert!(!PaymentStatus::Paid.can_move_to(PaymentStatus::Failed));
        assert!(!PaymentStatus::Paid.can_move_to(PaymentStatus::Refunded));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&OrderStatus::OutForDelivery).unwrap();
        assert_eq!(json, "\"OUT_FOR_DELIVERY\"");
        let back: OrderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OrderStatus::OutForDelivery);
        assert_eq!(OrderStatus::OutForDelivery.to_string(), "OUT_FOR_DELIVERY");
    }
}
