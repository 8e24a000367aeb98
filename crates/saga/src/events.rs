//! Workflow instance events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::DomainEvent;
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::error::StepError;
use crate::signal::{SagaSignal, SignalKind};

/// Everything that can happen to a workflow instance. The instance state is
/// the fold of these, so they are never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    SagaStarted(SagaStartedData),

    /// An attempt of a step began.
    StepStarted(StepAttemptData),

    /// The step registered interest in external signals and suspended.
    StepPending(StepPendingData),

    SignalReceived(SignalReceivedData),

    StepCompleted(StepCompletedData),

    StepFailed(StepFailedData),

    StepRetryScheduled(RetryScheduledData),

    /// The forward path stopped; completed steps are reversed next.
    CompensationStarted(CompensationStartedData),

    CompensationStepCompleted(ReversalData),

    CompensationStepFailed(ReversalFailedData),

    SagaCompleted(FinishedData),

    SagaCompensated(SagaCompensatedData),

    /// A reversal failed and automation stopped; an operator must act.
    CompensationEscalated(EscalationData),

    /// An operator abandoned the escalated instance.
    SagaFailed(SagaFailedData),

    EscalationResolved(EscalationResolvedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepPending(_) => "StepPending",
            SagaEvent::SignalReceived(_) => "SignalReceived",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::StepRetryScheduled(_) => "StepRetryScheduled",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::CompensationEscalated(_) => "CompensationEscalated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::EscalationResolved(_) => "EscalationResolved",
        }
    }
}

impl SagaEvent {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SagaEvent::SagaStarted(d) => d.started_at,
            SagaEvent::StepStarted(d) => d.at,
            SagaEvent::StepPending(d) => d.at,
            SagaEvent::SignalReceived(d) => d.at,
            SagaEvent::StepCompleted(d) => d.at,
            SagaEvent::StepFailed(d) => d.at,
            SagaEvent::StepRetryScheduled(d) => d.at,
            SagaEvent::CompensationStarted(d) => d.at,
            SagaEvent::CompensationStepCompleted(d) => d.at,
            SagaEvent::CompensationStepFailed(d) => d.at,
            SagaEvent::SagaCompleted(d) => d.at,
            SagaEvent::SagaCompensated(d) => d.at,
            SagaEvent::CompensationEscalated(d) => d.at,
            SagaEvent::SagaFailed(d) => d.at,
            SagaEvent::EscalationResolved(d) => d.at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub instance_id: AggregateId,
    pub definition_id: String,
    pub definition_version: u32,
    pub context: WorkflowContext,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttemptData {
    pub step_index: usize,
    pub step_name: String,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPendingData {
    pub step_index: usize,
    pub step_name: String,
    pub awaiting: Vec<SignalKind>,
    pub context: WorkflowContext,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReceivedData {
    pub step_index: usize,
    pub signal: SagaSignal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_index: usize,
    pub step_name: String,
    pub context: WorkflowContext,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub error: StepError,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryScheduledData {
    pub step_index: usize,
    pub step_name: String,
    pub next_attempt: u32,
    pub delay_ms: u64,
    pub at: DateTime<Utc>,
}

/// Why the forward path stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailure {
    pub step_index: usize,
    pub step_name: String,
    /// Machine-readable reason, e.g. `PAYMENT_FAILED`.
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    pub failure: SagaFailure,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalData {
    pub step_index: usize,
    pub step_name: String,
    pub result: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub error: StepError,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedData {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompensatedData {
    /// Steps whose reversal failed and were left for manual remediation.
    pub unreversed: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationData {
    pub failed_step: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Operator decision on an escalated instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    /// The failed reversal was carried out by hand.
    MarkCompensated { note: String },
    /// Nothing more will be done; the instance ends FAILED.
    Abandon { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationResolvedData {
    pub resolution: Resolution,
    pub at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        instance_id: AggregateId,
        definition_id: impl Into<String>,
        definition_version: u32,
        context: WorkflowContext,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            instance_id,
            definition_id: definition_id.into(),
            definition_version,
            context,
            started_at: Utc::now(),
        })
    }

    pub fn step_started(step_index: usize, step_name: impl Into<String>, attempt: u32) -> Self {
        SagaEvent::StepStarted(StepAttemptData {
            step_index,
            step_name: step_name.into(),
            attempt,
            at: Utc::now(),
        })
    }

    pub fn step_pending(
        step_index: usize,
        step_name: impl Into<String>,
        awaiting: Vec<SignalKind>,
        context: WorkflowContext,
    ) -> Self {
        SagaEvent::StepPending(StepPendingData {
            step_index,
            step_name: step_name.into(),
            awaiting,
            context,
            at: Utc::now(),
        })
    }

    pub fn signal_received(step_index: usize, signal: SagaSignal) -> Self {
        SagaEvent::SignalReceived(SignalReceivedData {
            step_index,
            signal,
            at: Utc::now(),
        })
    }

    pub fn step_completed(
        step_index: usize,
        step_name: impl Into<String>,
        context: WorkflowContext,
        note: Option<String>,
    ) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step_index,
            step_name: step_name.into(),
            context,
            note,
            at: Utc::now(),
        })
    }

    pub fn step_failed(
        step_index: usize,
        step_name: impl Into<String>,
        attempt: u32,
        error: StepError,
    ) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_index,
            step_name: step_name.into(),
            attempt,
            error,
            at: Utc::now(),
        })
    }

    pub fn retry_scheduled(
        step_index: usize,
        step_name: impl Into<String>,
        next_attempt: u32,
        delay: std::time::Duration,
    ) -> Self {
        SagaEvent::StepRetryScheduled(RetryScheduledData {
            step_index,
            step_name: step_name.into(),
            next_attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            at: Utc::now(),
        })
    }

    pub fn compensation_started(failure: SagaFailure) -> Self {
        SagaEvent::CompensationStarted(CompensationStartedData {
            failure,
            at: Utc::now(),
        })
    }

    pub fn compensation_step_completed(
        step_index: usize,
        step_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepCompleted(ReversalData {
            step_index,
            step_name: step_name.into(),
            result: result.into(),
            at: Utc::now(),
        })
    }

    pub fn compensation_step_failed(
        step_index: usize,
        step_name: impl Into<String>,
        error: StepError,
    ) -> Self {
        SagaEvent::CompensationStepFailed(ReversalFailedData {
            step_index,
            step_name: step_name.into(),
            error,
            at: Utc::now(),
        })
    }

    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(FinishedData { at: Utc::now() })
    }

    pub fn saga_compensated(unreversed: Vec<String>) -> Self {
        SagaEvent::SagaCompensated(SagaCompensatedData {
            unreversed,
            at: Utc::now(),
        })
    }

    pub fn compensation_escalated(
        failed_step: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationEscalated(EscalationData {
            failed_step: failed_step.into(),
            error: error.into(),
            at: Utc::now(),
        })
    }

    pub fn saga_failed(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn escalation_resolved(resolution: Resolution) -> Self {
        SagaEvent::EscalationResolved(EscalationResolvedData {
            resolution,
            at: Utc::now(),
        })
    }
}
