use chrono::{DateTime, Utc};
use domain::Money;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;

/// Final outcome a gateway reports for a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentOutcome {
    Success,
    Failed,
    Timeout,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Success => "SUCCESS",
            PaymentOutcome::Failed => "FAILED",
            PaymentOutcome::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for PaymentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-neutral payment notification produced by a [`GatewayAdapter`](crate::GatewayAdapter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalPaymentEvent {
    pub provider: ProviderId,
    /// Our payment reference, echoed back by the gateway.
    pub reference: String,
    pub status: PaymentOutcome,
    pub amount: Money,
    pub currency: String,
    pub provider_transaction_id: String,
    pub timestamp: DateTime<Utc>,
    /// Gateway reason code on failure, e.g. `INSUFFICIENT_FUNDS`.
    pub failure_reason: Option<String>,
}

impl CanonicalPaymentEvent {
    pub fn is_success(&self) -> bool {
        self.status == PaymentOutcome::Success
    }
}
