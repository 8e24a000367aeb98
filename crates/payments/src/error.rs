use thiserror::Error;

use crate::provider::ProviderId;

/// Why a webhook was not accepted.
///
/// Rejections never have side effects: nothing is reserved in the
/// idempotency store and the ledger is untouched.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no adapter registered for provider {0}")]
    UnsupportedProvider(ProviderId),

    /// Deliberately carries no detail.
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("no payment recorded for reference {0}")]
    UnknownReference(String),

    /// The payment event was valid but the consumer failed to apply it.
    /// The delivery is not marked processed, so a redelivery retries it.
    #[error("payment event could not be applied: {0}")]
    Downstream(String),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl WebhookError {
    /// Short label used for the `outcome` metric tag.
    pub fn outcome(&self) -> &'static str {
        match self {
            WebhookError::UnsupportedProvider(_) => "unsupported_provider",
            WebhookError::InvalidSignature => "invalid_signature",
            WebhookError::MalformedPayload(_) => "malformed",
            WebhookError::UnknownReference(_) => "unknown_reference",
            WebhookError::Downstream(_) => "downstream_error",
            WebhookError::Payment(_) => "ledger_error",
        }
    }
}

/// Errors returned by a [`PaymentGateway`](crate::PaymentGateway).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("charge declined: {0}")]
    Declined(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("refund rejected: {0}")]
    RefundRejected(String),
}

impl GatewayError {
    /// Unavailability is worth retrying; everything else is a decision.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Errors from the local payment ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("payment reference already recorded: {0}")]
    DuplicateReference(String),

    #[error("payment not found: {0}")]
    NotFound(String),

    #[error("payment {reference} cannot be refunded in status {status}")]
    NotRefundable { reference: String, status: String },

    #[error("order lookup failed: {0}")]
    OrderLookup(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
