//! Reversal of completed steps after a workflow fails.
//!
//! A failed reversal is never retried here: retrying a refund that may have
//! half-happened risks reversing twice. Under the sequential and parallel
//! strategies it is escalated to the [`EscalationQueue`] instead and the
//! instance stays COMPENSATING until an operator resolves it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::Aggregate;
use futures_util::future::join_all;
use idempotency::{IdempotencyKey, IdempotencyStore, Reservation};
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::definition::{CompensationStrategy, StepDescriptor, WorkflowDefinition};
use crate::error::{Result, SagaError, StepError};
use crate::events::SagaEvent;
use crate::instance::{ReversalFailure, WorkflowInstance};
use crate::registry::{ActionRegistry, StepInput};
use crate::repository::InstanceRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reversal {
    pub step: String,
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationResult {
    pub success: bool,
    pub completed_reversals: Vec<Reversal>,
    /// First reversal that failed, in the order reversals were attempted.
    pub failed_step: Option<String>,
    pub error: Option<String>,
    /// Every failed reversal of this run.
    pub failures: Vec<ReversalFailure>,
}

impl CompensationResult {
    fn record_success(&mut self, step: &str, result: String) {
        self.completed_reversals.push(Reversal {
            step: step.to_string(),
            result,
        });
    }

    fn record_failure(&mut self, index: usize, step: &str, error: StepError) {
        if self.failed_step.is_none() {
            self.failed_step = Some(step.to_string());
            self.error = Some(error.to_string());
        }
        self.failures.push(ReversalFailure {
            step_index: index,
            step_name: step.to_string(),
            error,
        });
    }
}

/// An instance waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub instance_id: AggregateId,
    pub failed_step: String,
    pub error: String,
    pub escalated_at: DateTime<Utc>,
}

/// Manual-intervention queue. Rebuilt from the event store by
/// [`SagaExecutor::recover`](crate::SagaExecutor::recover).
#[derive(Debug, Clone, Default)]
pub struct EscalationQueue {
    entries: Arc<Mutex<Vec<Escalation>>>,
}

impl EscalationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an escalation; an instance is queued at most once.
    pub fn push(&self, escalation: Escalation) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .iter()
            .all(|e| e.instance_id != escalation.instance_id)
        {
            entries.push(escalation);
        }
    }

    pub fn remove(&self, instance_id: AggregateId) -> Option<Escalation> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let position = entries.iter().position(|e| e.instance_id == instance_id)?;
        Some(entries.remove(position))
    }

    pub fn list(&self) -> Vec<Escalation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, instance_id: AggregateId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.instance_id == instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An effect left in place by a finished instance that has to be undone
/// by hand: a best-effort reversal that failed, or a payment captured
/// after the instance stopped waiting for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub instance_id: AggregateId,
    pub step: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Open remediations, one per instance and step.
#[derive(Debug, Clone, Default)]
pub struct RemediationList {
    entries: Arc<Mutex<Vec<Remediation>>>,
}

impl RemediationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a remediation unless the same instance and step is already
    /// open. Returns true if it was added.
    pub fn push(&self, remediation: Remediation) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .iter()
            .any(|r| r.instance_id == remediation.instance_id && r.step == remediation.step)
        {
            return false;
        }
        entries.push(remediation);
        true
    }

    /// Closes every open remediation of an instance once an operator has
    /// dealt with it.
    pub fn acknowledge(&self, instance_id: AggregateId) -> Vec<Remediation> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (done, open) = entries
            .drain(..)
            .partition(|r: &Remediation| r.instance_id == instance_id);
        *entries = open;
        done
    }

    pub fn for_instance(&self, instance_id: AggregateId) -> Vec<Remediation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Remediation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PlannedReversal<'a> {
    index: usize,
    step: &'a StepDescriptor,
    action: String,
}

pub struct CompensationCoordinator {
    repository: InstanceRepository,
    actions: Arc<ActionRegistry>,
    results: IdempotencyStore<String>,
}

impl CompensationCoordinator {
    pub fn new(
        repository: InstanceRepository,
        actions: Arc<ActionRegistry>,
        results: IdempotencyStore<String>,
    ) -> Self {
        Self {
            repository,
            actions,
            results,
        }
    }

    /// Reverses the instance's completed steps, newest first, according to
    /// the definition's strategy. Each outcome is appended to the instance
    /// stream. Steps already reversed (or whose reversal already failed) and
    /// steps without a compensating action are skipped.
    #[tracing::instrument(skip_all, fields(instance_id = ?instance.id(), strategy = %definition.compensation_strategy))]
    pub async fn compensate(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<CompensationResult> {
        let instance_id = instance
            .id()
            .ok_or_else(|| SagaError::InvalidContext("instance has not started".to_string()))?;
        let context = instance
            .context()
            .cloned()
            .ok_or_else(|| SagaError::InvalidContext("instance has no context".to_string()))?;

        let plan: Vec<PlannedReversal<'_>> = instance
            .completed_steps()
            .iter()
            .rev()
            .filter(|index| !instance.reversal_attempted(**index))
            .filter_map(|&index| {
                let step = definition.step_at(index)?;
                let action = step.compensation.clone()?;
                Some(PlannedReversal {
                    index,
                    step,
                    action,
                })
            })
            .collect();

        tracing::info!(reversals = plan.len(), "compensation started");
        let mut result = CompensationResult::default();

        match definition.compensation_strategy {
            CompensationStrategy::Sequential | CompensationStrategy::BestEffort => {
                let stop_on_failure =
                    definition.compensation_strategy == CompensationStrategy::Sequential;
                for planned in &plan {
                    let outcome = self.reverse(instance_id, planned, &context).await;
                    let failed = outcome.is_err();
                    self.record(instance, &mut result, planned, outcome).await?;
                    if failed && stop_on_failure {
                        tracing::warn!(step = %planned.step.name, "stopping at first failed reversal");
                        break;
                    }
                }
            }
            CompensationStrategy::Parallel => {
                let outcomes = join_all(
                    plan.iter()
                        .map(|planned| self.reverse(instance_id, planned, &context)),
                )
                .await;
                for (planned, outcome) in plan.iter().zip(outcomes) {
                    self.record(instance, &mut result, planned, outcome).await?;
                }
            }
        }

        result.success = result.failures.is_empty();
        Ok(result)
    }

    async fn reverse(
        &self,
        instance_id: AggregateId,
        planned: &PlannedReversal<'_>,
        context: &WorkflowContext,
    ) -> std::result::Result<String, StepError> {
        let action = self.actions.compensation(&planned.action).ok_or_else(|| {
            StepError::permanent(
                "UNKNOWN_ACTION",
                format!("no compensation registered as {}", planned.action),
            )
        })?;

        let key = IdempotencyKey::step(instance_id, planned.index, "compensate");
        let guard = match self.results.check_and_reserve(&key).await {
            Reservation::Cached(cached) => {
                tracing::debug!(step = %planned.step.name, "reversal already performed");
                return Ok(cached.result);
            }
            Reservation::FirstTime(guard) => guard,
        };

        let input = StepInput {
            instance_id,
            step_index: planned.index,
            step_name: &planned.step.name,
            attempt: 1,
            context,
        };
        let outcome = match planned.step.timeout {
            Some(limit) => tokio::time::timeout(limit, action.compensate(input))
                .await
                .unwrap_or_else(|_| {
                    Err(StepError::transient(format!(
                        "reversal timed out after {}ms",
                        limit.as_millis()
                    )))
                }),
            None => action.compensate(input).await,
        };

        if let Ok(summary) = &outcome {
            guard.complete(summary.clone());
        }
        outcome
    }

    async fn record(
        &self,
        instance: &mut WorkflowInstance,
        result: &mut CompensationResult,
        planned: &PlannedReversal<'_>,
        outcome: std::result::Result<String, StepError>,
    ) -> Result<()> {
        let name = &planned.step.name;
        match outcome {
            Ok(summary) => {
                tracing::info!(step = %name, result = %summary, "step reversed");
                self.repository
                    .append(
                        instance,
                        SagaEvent::compensation_step_completed(planned.index, name, &summary),
                    )
                    .await?;
                result.record_success(name, summary);
            }
            Err(error) => {
                tracing::error!(step = %name, %error, "reversal failed");
                metrics::counter!("saga_compensation_failures_total", "step" => name.clone())
                    .increment(1);
                self.repository
                    .append(
                        instance,
                        SagaEvent::compensation_step_failed(planned.index, name, error.clone()),
                    )
                    .await?;
                result.record_failure(planned.index, name, error);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escalation(instance_id: AggregateId) -> Escalation {
        Escalation {
            instance_id,
            failed_step: "charge_payment".to_string(),
            error: "REFUND_REJECTED".to_string(),
            escalated_at: Utc::now(),
        }
    }

    #[test]
    fn test_queue_dedupes_by_instance() {
        let queue = EscalationQueue::new();
        let id = AggregateId::new();
        queue.push(escalation(id));
        queue.push(escalation(id));
        queue.push(escalation(AggregateId::new()));

        assert_eq!(queue.len(), 2);
        assert!(queue.contains(id));
        assert_eq!(queue.remove(id).unwrap().instance_id, id);
        assert!(!queue.contains(id));
        assert!(queue.remove(id).is_none());
    }

    fn remediation(instance_id: AggregateId, step: &str) -> Remediation {
        Remediation {
            instance_id,
            step: step.to_string(),
            reason: "provider refused".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_remediations_dedupe_by_instance_and_step() {
        let list = RemediationList::new();
        let id = AggregateId::new();
        let other = AggregateId::new();

        assert!(list.push(remediation(id, "charge_payment")));
        assert!(!list.push(remediation(id, "charge_payment")));
        assert!(list.push(remediation(id, "assign_delivery")));
        assert!(list.push(remediation(other, "charge_payment")));
        assert_eq!(list.len(), 3);
        assert_eq!(list.for_instance(id).len(), 2);

        let closed = list.acknowledge(id);
        assert_eq!(closed.len(), 2);
        let open = list.list();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].instance_id, other);
        assert!(list.acknowledge(id).is_empty());
    }

    #[test]
    fn test_result_keeps_first_failure() {
        let mut result = CompensationResult::default();
        result.record_success("assign_delivery", "cancelled".to_string());
        result.record_failure(1, "charge_payment", StepError::permanent("REFUND_REJECTED", "no"));
        result.record_failure(0, "reserve_inventory", StepError::transient("down"));

        assert_eq!(result.failed_step.as_deref(), Some("charge_payment"));
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.completed_reversals[0].step, "assign_delivery");
    }
}
