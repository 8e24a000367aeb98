//! Workflow instance aggregate.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Aggregate, DomainEvent};
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::error::{SagaError, StepError};
use crate::events::{Resolution, SagaEvent, SagaFailure};
use crate::signal::{SagaSignal, SignalKind};

/// Lifecycle of a workflow instance.
///
/// ```text
/// RUNNING ──┬──► COMPLETED
///           └──► COMPENSATING ──┬──► COMPENSATED
///                               └──► (escalated) ──► COMPENSATED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    #[default]
    Running,
    Completed,
    Compensating,
    Compensated,
    /// Only reached when an operator abandons an escalated instance.
    Failed,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "RUNNING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step suspended until one of `awaiting` arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStep {
    pub step_index: usize,
    pub step_name: String,
    pub awaiting: Vec<SignalKind>,
}

impl PendingStep {
    pub fn awaits(&self, kind: SignalKind) -> bool {
        self.awaiting.contains(&kind)
    }
}

/// One line of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event_type: String,
    pub step_index: Option<usize>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// A reversal that failed and was not retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalFailure {
    pub step_index: usize,
    pub step_name: String,
    pub error: StepError,
}

/// An event-sourced workflow instance.
///
/// Rebuilt by replaying its stream; nothing here is mutated except through
/// [`Aggregate::apply`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowInstance {
    id: Option<AggregateId>,
    version: Version,
    definition_id: String,
    definition_version: u32,
    status: SagaStatus,
    current_step_index: usize,
    context: Option<WorkflowContext>,
    history: Vec<HistoryEntry>,
    pending: Option<PendingStep>,
    received_signal: Option<SagaSignal>,
    accepted_signals: Vec<SignalKind>,
    attempts: HashMap<usize, u32>,
    completed_steps: Vec<usize>,
    compensated_steps: Vec<usize>,
    compensation_failures: Vec<ReversalFailure>,
    failure: Option<SagaFailure>,
    failed_compensation_step: Option<String>,
    escalated: bool,
    resolution: Option<Resolution>,
    unreversed: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Aggregate for WorkflowInstance {
    type Event = SagaEvent;
    type Error = SagaError;

    fn aggregate_type() -> &'static str {
        "WorkflowInstance"
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
        let at = event.occurred_at();
        let event_type = event.event_type();
        let (step_index, detail) = match event {
            SagaEvent::SagaStarted(data) => {
                self.id = Some(data.instance_id);
                self.definition_id = data.definition_id;
                self.definition_version = data.definition_version;
                self.context = Some(data.context);
                self.status = SagaStatus::Running;
                self.current_step_index = 0;
                self.created_at = data.started_at;
                (None, None)
            }
            SagaEvent::StepStarted(data) => {
                self.current_step_index = data.step_index;
                self.attempts.insert(data.step_index, data.attempt);
                (Some(data.step_index), Some(format!("attempt {}", data.attempt)))
            }
            SagaEvent::StepPending(data) => {
                let detail = data
                    .awaiting
                    .iter()
                    .map(SignalKind::as_str)
                    .collect::<Vec<_>>()
                    .join(",");
                self.context = Some(data.context);
                self.received_signal = None;
                self.pending = Some(PendingStep {
                    step_index: data.step_index,
                    step_name: data.step_name,
                    awaiting: data.awaiting,
                });
                (Some(data.step_index), Some(format!("awaiting {detail}")))
            }
            SagaEvent::SignalReceived(data) => {
                self.pending = None;
                let kind = data.signal.kind();
                self.accepted_signals.push(kind);
                self.received_signal = Some(data.signal);
                let detail = kind.to_string();
                (Some(data.step_index), Some(detail))
            }
            SagaEvent::StepCompleted(data) => {
                self.context = Some(data.context);
                self.pending = None;
                self.received_signal = None;
                self.completed_steps.push(data.step_index);
                self.current_step_index = data.step_index + 1;
                (Some(data.step_index), data.note)
            }
            SagaEvent::StepFailed(data) => (Some(data.step_index), Some(data.error.to_string())),
            SagaEvent::StepRetryScheduled(data) => (
                Some(data.step_index),
                Some(format!("attempt {} in {}ms", data.next_attempt, data.delay_ms)),
            ),
            SagaEvent::CompensationStarted(data) => {
                self.status = SagaStatus::Compensating;
                self.pending = None;
                self.received_signal = None;
                let index = data.failure.step_index;
                let detail = format!("{}: {}", data.failure.code, data.failure.message);
                self.failure = Some(data.failure);
                (Some(index), Some(detail))
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.current_step_index = data.step_index;
                self.compensated_steps.push(data.step_index);
                (Some(data.step_index), Some(data.result))
            }
            SagaEvent::CompensationStepFailed(data) => {
                self.current_step_index = data.step_index;
                let detail = data.error.to_string();
                self.compensation_failures.push(ReversalFailure {
                    step_index: data.step_index,
                    step_name: data.step_name,
                    error: data.error,
                });
                (Some(data.step_index), Some(detail))
            }
            SagaEvent::SagaCompleted(_) => {
                self.status = SagaStatus::Completed;
                (None, None)
            }
            SagaEvent::SagaCompensated(data) => {
                self.status = SagaStatus::Compensated;
                self.unreversed = data.unreversed;
                (None, None)
            }
            SagaEvent::CompensationEscalated(data) => {
                self.escalated = true;
                let detail = format!("{}: {}", data.failed_step, data.error);
                self.failed_compensation_step = Some(data.failed_step);
                (None, Some(detail))
            }
            SagaEvent::SagaFailed(data) => {
                self.status = SagaStatus::Failed;
                (None, Some(data.reason))
            }
            SagaEvent::EscalationResolved(data) => {
                self.escalated = false;
                self.resolution = Some(data.resolution);
                (None, None)
            }
        };

        self.updated_at = at;
        self.history.push(HistoryEntry {
            event_type: event_type.to_string(),
            step_index,
            detail,
            at,
        });
    }
}

// Query methods
impl WorkflowInstance {
    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn definition_version(&self) -> u32 {
        self.definition_version
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Next step to run while RUNNING; the step being reversed while
    /// COMPENSATING.
    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn context(&self) -> Option<&WorkflowContext> {
        self.context.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn pending(&self) -> Option<&PendingStep> {
        self.pending.as_ref()
    }

    /// Signal accepted for the current step but not yet fully handled.
    pub fn received_signal(&self) -> Option<&SagaSignal> {
        self.received_signal.as_ref()
    }

    /// True if a signal of `kind` was ever accepted by a pending step.
    pub fn has_accepted(&self, kind: SignalKind) -> bool {
        self.accepted_signals.contains(&kind)
    }

    /// Indices of completed forward steps, in completion order.
    pub fn completed_steps(&self) -> &[usize] {
        &self.completed_steps
    }

    pub fn compensated_steps(&self) -> &[usize] {
        &self.compensated_steps
    }

    pub fn compensation_failures(&self) -> &[ReversalFailure] {
        &self.compensation_failures
    }

    /// True if the reversal of `step_index` has already been attempted,
    /// successfully or not.
    pub fn reversal_attempted(&self, step_index: usize) -> bool {
        self.compensated_steps.contains(&step_index)
            || self
                .compensation_failures
                .iter()
                .any(|f| f.step_index == step_index)
    }

    pub fn failure(&self) -> Option<&SagaFailure> {
        self.failure.as_ref()
    }

    pub fn failed_compensation_step(&self) -> Option<&str> {
        self.failed_compensation_step.as_deref()
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn unreversed(&self) -> &[String] {
        &self.unreversed
    }

    /// Attempts made so far on `step_index`; 0 if it never started.
    pub fn attempts_for(&self, step_index: usize) -> u32 {
        self.attempts.get(&step_index).copied().unwrap_or(0)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
