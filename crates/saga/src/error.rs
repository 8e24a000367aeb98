//! Saga error types.

use common::AggregateId;
use domain::DomainError;
use event_store::EventStoreError;
use payments::{GatewayError, PaymentError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextKind;
use crate::instance::SagaStatus;

/// Errors returned by the executor and the registries.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("workflow definition not found: {id} (version {version:?})")]
    DefinitionNotFound { id: String, version: Option<u32> },

    #[error("workflow definition {id} v{version} is already published")]
    DuplicateDefinition { id: String, version: u32 },

    #[error("no action registered under {0:?}")]
    UnknownAction(String),

    #[error("context kind {actual} does not match workflow context {expected}")]
    ContextMismatch {
        expected: ContextKind,
        actual: ContextKind,
    },

    #[error("unsupported {kind} context schema version {version}")]
    UnsupportedSchema { kind: ContextKind, version: u32 },

    #[error("invalid workflow context: {0}")]
    InvalidContext(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(AggregateId),

    /// Cancellation only applies to running instances. A completed order
    /// goes through the refund workflow instead.
    #[error("instance {instance_id} cannot be cancelled in status {status}")]
    NotCancellable {
        instance_id: AggregateId,
        status: SagaStatus,
    },

    #[error("instance {0} has no open escalation")]
    NotEscalated(AggregateId),

    #[error("step {step} failed after {attempts} attempts")]
    RetriesExhausted { step: String, attempts: u32 },

    #[error("compensation of step {step} failed: {error}")]
    CompensationFailed { step: String, error: String },

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Failure of a single step attempt or reversal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StepError {
    /// Worth retrying under the step's retry policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help; compensation starts immediately. `code` becomes
    /// the order's cancellation reason.
    #[error("{code}: {message}")]
    Permanent { code: String, message: String },
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    pub fn code(&self) -> &str {
        match self {
            StepError::Transient(_) => "RETRIES_EXHAUSTED",
            StepError::Permanent { code, .. } => code,
        }
    }
}

impl From<DomainError> for StepError {
    fn from(e: DomainError) -> Self {
        if e.is_conflict() {
            StepError::transient(e.to_string())
        } else {
            StepError::permanent("ORDER_REJECTED", e.to_string())
        }
    }
}

impl From<GatewayError> for StepError {
    fn from(e: GatewayError) -> Self {
        match &e {
            GatewayError::Unavailable(_) => StepError::transient(e.to_string()),
            GatewayError::Declined(_) => StepError::permanent("PAYMENT_DECLINED", e.to_string()),
            GatewayError::RefundRejected(_) => {
                StepError::permanent("REFUND_REJECTED", e.to_string())
            }
            GatewayError::NotFound(_) => StepError::permanent("PAYMENT_NOT_FOUND", e.to_string()),
        }
    }
}

impl From<PaymentError> for StepError {
    fn from(e: PaymentError) -> Self {
        match e {
            PaymentError::Gateway(g) => g.into(),
            other => StepError::permanent("PAYMENT_LEDGER", other.to_string()),
        }
    }
}

impl From<SagaError> for StepError {
    fn from(e: SagaError) -> Self {
        StepError::permanent("INTERNAL", e.to_string())
    }
}
