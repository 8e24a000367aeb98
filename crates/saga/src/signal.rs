//! External events that resume a suspended workflow.

use std::fmt;

use domain::Money;
use payments::{CanonicalPaymentEvent, PaymentOutcome};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SagaSignal {
    PaymentSucceeded {
        reference: String,
        provider_transaction_id: String,
        amount: Money,
    },
    PaymentFailed {
        reference: String,
        reason: String,
    },
    PaymentTimedOut {
        reference: String,
    },
    VendorAccepted,
    VendorRejected {
        reason: String,
    },
    /// Explicit cancellation by an actor.
    Cancel {
        reason: String,
    },
}

impl SagaSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            SagaSignal::PaymentSucceeded { .. } => SignalKind::PaymentSucceeded,
            SagaSignal::PaymentFailed { .. } => SignalKind::PaymentFailed,
            SagaSignal::PaymentTimedOut { .. } => SignalKind::PaymentTimedOut,
            SagaSignal::VendorAccepted => SignalKind::VendorAccepted,
            SagaSignal::VendorRejected { .. } => SignalKind::VendorRejected,
            SagaSignal::Cancel { .. } => SignalKind::Cancel,
        }
    }

    pub fn from_payment_event(event: &CanonicalPaymentEvent) -> Self {
        match event.status {
            PaymentOutcome::Success => SagaSignal::PaymentSucceeded {
                reference: event.reference.clone(),
                provider_transaction_id: event.provider_transaction_id.clone(),
                amount: event.amount,
            },
            PaymentOutcome::Failed => SagaSignal::PaymentFailed {
                reference: event.reference.clone(),
                reason: event
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "DECLINED".to_string()),
            },
            PaymentOutcome::Timeout => SagaSignal::PaymentTimedOut {
                reference: event.reference.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentTimedOut,
    VendorAccepted,
    VendorRejected,
    Cancel,
}

impl SignalKind {
    pub const PAYMENT: [SignalKind; 3] = [
        SignalKind::PaymentSucceeded,
        SignalKind::PaymentFailed,
        SignalKind::PaymentTimedOut,
    ];

    pub const VENDOR: [SignalKind; 2] = [SignalKind::VendorAccepted, SignalKind::VendorRejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::PaymentSucceeded => "payment_succeeded",
            SignalKind::PaymentFailed => "payment_failed",
            SignalKind::PaymentTimedOut => "payment_timed_out",
            SignalKind::VendorAccepted => "vendor_accepted",
            SignalKind::VendorRejected => "vendor_rejected",
            SignalKind::Cancel => "cancel",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use payments::ProviderId;

    fn event(status: PaymentOutcome, reason: Option<&str>) -> CanonicalPaymentEvent {
        CanonicalPaymentEvent {
            provider: ProviderId::EcoCash,
            reference: "PAY-1".to_string(),
            status,
            amount: Money::from_cents(2350),
            currency: "USD".to_string(),
            provider_transaction_id: "MP-1".to_string(),
            timestamp: Utc::now(),
            failure_reason: reason.map(str::to_string),
        }
    }

    #[test]
    fn test_payment_events_map_to_signals() {
        assert_eq!(
            SagaSignal::from_payment_event(&event(PaymentOutcome::Success, None)).kind(),
            SignalKind::PaymentSucceeded
        );
        assert_eq!(
            SagaSignal::from_payment_event(&event(PaymentOutcome::Failed, Some("INSUFFICIENT_FUNDS"))),
            SagaSignal::PaymentFailed {
                reference: "PAY-1".to_string(),
                reason: "INSUFFICIENT_FUNDS".to_string(),
            }
        );
        assert_eq!(
            SagaSignal::from_payment_event(&event(PaymentOutcome::Timeout, None)).kind(),
            SignalKind::PaymentTimedOut
        );
    }

    #[test]
    fn test_serialization_is_tagged() {
        let json = serde_json::to_value(SagaSignal::VendorAccepted).unwrap();
        assert_eq!(json["signal"], "vendor_accepted");
    }
}
