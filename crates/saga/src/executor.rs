//! Saga executor.
//!
//! Drives workflow instances forward one step at a time, suspends them
//! while a step awaits a signal, and hands failed instances to the
//! [`CompensationCoordinator`]. Every transition is appended to the
//! instance stream before the executor acts on it, so [`recover`] can
//! pick up any non-terminal instance after a restart.
//!
//! Work on one instance is serialized by a per-instance lock; different
//! instances run concurrently. A lock is forgotten as soon as no caller
//! holds or waits on it.
//!
//! [`recover`]: SagaExecutor::recover

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use common::AggregateId;
use domain::{Aggregate, PaymentStatus};
use event_store::EventStore;
use idempotency::{IdempotencyKey, IdempotencyStore, Reservation};
use payments::{
    CanonicalPaymentEvent, PaymentEventSink, PaymentOutcome, PaymentRecord, WebhookError,
};
use tokio::sync::OwnedMutexGuard;

use crate::compensation::{
    CompensationCoordinator, Escalation, EscalationQueue, Remediation, RemediationList,
};
use crate::config::SagaConfig;
use crate::context::WorkflowContext;
use crate::definition::{CompensationStrategy, StepDescriptor, WorkflowDefinition};
use crate::error::{Result, SagaError, StepError};
use crate::events::{Resolution, SagaEvent, SagaFailure};
use crate::instance::{SagaStatus, WorkflowInstance};
use crate::registry::{ActionRegistry, DefinitionRegistry, StepInput, StepOutcome};
use crate::repository::InstanceRepository;
use crate::signal::{SagaSignal, SignalKind};

/// Failure code recorded when an instance is cancelled by request.
pub const CANCELLED_CODE: &str = "CANCELLED";

/// Remediation step recorded for a payment captured after its instance
/// stopped waiting for it.
pub const LATE_CAPTURE_STEP: &str = "late_payment_capture";

type LockMap = Mutex<HashMap<AggregateId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one instance. Dropping it releases the instance and
/// removes its lock from the map when nobody else holds or waits on it.
struct InstanceGuard<'a> {
    locks: &'a LockMap,
    instance_id: AggregateId,
    lock: Arc<tokio::sync::Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this guard still point at the lock.
        let unused = Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.instance_id)
                .is_some_and(|current| Arc::ptr_eq(current, &self.lock));
        if unused {
            locks.remove(&self.instance_id);
        }
    }
}

pub struct SagaExecutor {
    repository: InstanceRepository,
    definitions: DefinitionRegistry,
    actions: Arc<ActionRegistry>,
    compensator: CompensationCoordinator,
    escalations: EscalationQueue,
    remediations: RemediationList,
    step_results: IdempotencyStore<StepOutcome>,
    locks: LockMap,
}

impl SagaExecutor {
    pub fn new(
        store: Arc<dyn EventStore>,
        definitions: DefinitionRegistry,
        actions: ActionRegistry,
        config: &SagaConfig,
    ) -> Self {
        let ttl = chrono::Duration::days(config.idempotency_ttl_days);
        let repository = InstanceRepository::new(store);
        let actions = Arc::new(actions);
        let compensator = CompensationCoordinator::new(
            repository.clone(),
            actions.clone(),
            IdempotencyStore::new(ttl),
        );

        Self {
            repository,
            definitions,
            actions,
            compensator,
            escalations: EscalationQueue::new(),
            remediations: RemediationList::new(),
            step_results: IdempotencyStore::new(ttl),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn repository(&self) -> &InstanceRepository {
        &self.repository
    }

    /// Instances awaiting manual intervention.
    pub fn escalations(&self) -> &EscalationQueue {
        &self.escalations
    }

    /// Effects left behind by finished instances that an operator has to
    /// undo: unreversed best-effort steps and late payment captures.
    pub fn remediations(&self) -> &RemediationList {
        &self.remediations
    }

    /// Instances with a lock currently held or awaited.
    pub fn tracked_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn get_instance(&self, instance_id: AggregateId) -> Result<Option<WorkflowInstance>> {
        self.repository.load(instance_id).await
    }

    /// Starts a new instance of the latest version of `definition_id` and
    /// runs it until it completes, compensates, or suspends on a signal.
    #[tracing::instrument(skip(self, context), fields(workflow = %definition_id))]
    pub async fn start(
        &self,
        definition_id: &str,
        context: WorkflowContext,
    ) -> Result<AggregateId> {
        let definition = self.definitions.latest(definition_id)?;
        if context.kind() != definition.context_kind {
            return Err(SagaError::ContextMismatch {
                expected: definition.context_kind,
                actual: context.kind(),
            });
        }
        context.validate()?;

        let instance_id = AggregateId::new();
        let _guard = self.lock_instance(instance_id).await;

        let mut instance = self
            .repository
            .create(SagaEvent::saga_started(
                instance_id,
                &definition.id,
                definition.version,
                context,
            ))
            .await?;

        metrics::counter!("saga_started_total", "workflow" => definition.id.clone()).increment(1);
        tracing::info!(%instance_id, version = definition.version, "workflow started");

        self.drive(&mut instance, &definition).await?;
        Ok(instance_id)
    }

    /// Delivers a signal to an instance.
    ///
    /// A signal the current step is not waiting for (late, duplicate, or
    /// addressed to a finished instance) changes nothing and returns the
    /// current status. `Cancel` is the exception: it starts compensation of
    /// a running instance and is rejected once the instance has left
    /// RUNNING.
    #[tracing::instrument(skip(self, signal), fields(signal = %signal.kind()))]
    pub async fn resume(&self, instance_id: AggregateId, signal: SagaSignal) -> Result<SagaStatus> {
        let _guard = self.lock_instance(instance_id).await;
        self.deliver(instance_id, signal).await
    }

    /// Body of [`resume`](Self::resume); the caller holds the instance lock.
    async fn deliver(&self, instance_id: AggregateId, signal: SagaSignal) -> Result<SagaStatus> {
        let mut instance = self.repository.load_existing(instance_id).await?;
        let definition = self.definition_for(&instance)?;

        if let SagaSignal::Cancel { reason } = &signal {
            if instance.status() != SagaStatus::Running {
                return Err(SagaError::NotCancellable {
                    instance_id,
                    status: instance.status(),
                });
            }
            let step_index = instance.current_step_index();
            let step_name = definition
                .step_at(step_index)
                .map(|step| step.name.clone())
                .unwrap_or_default();
            tracing::info!(%instance_id, %reason, step = %step_name, "cancellation requested");

            let failure = SagaFailure {
                step_index,
                step_name,
                code: CANCELLED_CODE.to_string(),
                message: reason.clone(),
            };
            self.repository
                .append(&mut instance, SagaEvent::compensation_started(failure))
                .await?;
            self.drive(&mut instance, &definition).await?;
            return Ok(instance.status());
        }

        let awaiting = instance
            .pending()
            .filter(|pending| pending.awaits(signal.kind()))
            .map(|pending| pending.step_index);
        let Some(step_index) = awaiting.filter(|_| instance.status() == SagaStatus::Running)
        else {
            tracing::debug!(%instance_id, status = %instance.status(), "signal not awaited, ignoring");
            return Ok(instance.status());
        };

        metrics::counter!("saga_signals_total", "signal" => signal.kind().as_str()).increment(1);
        self.repository
            .append(&mut instance, SagaEvent::signal_received(step_index, signal))
            .await?;
        self.drive(&mut instance, &definition).await?;
        Ok(instance.status())
    }

    /// Cancels a running instance; shorthand for a `Cancel` signal.
    pub async fn cancel(
        &self,
        instance_id: AggregateId,
        reason: impl Into<String>,
    ) -> Result<SagaStatus> {
        self.resume(
            instance_id,
            SagaSignal::Cancel {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Resumes every instance left mid-flight, e.g. after a restart, and
    /// rebuilds the escalation queue. Returns the ids of instances that
    /// were driven.
    ///
    /// Failures are logged per instance and do not stop the scan.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<AggregateId>> {
        let mut resumed = Vec::new();

        for instance_id in self.repository.list_ids().await? {
            let _guard = self.lock_instance(instance_id).await;

            let Some(mut instance) = self.repository.load(instance_id).await? else {
                continue;
            };
            match instance.status() {
                SagaStatus::Running if instance.pending().is_none() => {}
                SagaStatus::Compensating if !instance.is_escalated() => {}
                SagaStatus::Compensating => {
                    self.requeue_escalation(instance_id, &instance);
                    continue;
                }
                SagaStatus::Compensated => {
                    self.requeue_remediations(instance_id, &instance);
                    continue;
                }
                _ => continue,
            }

            let definition = match self.definition_for(&instance) {
                Ok(definition) => definition,
                Err(error) => {
                    tracing::error!(%instance_id, %error, "cannot recover instance");
                    continue;
                }
            };

            tracing::info!(
                %instance_id,
                status = %instance.status(),
                step = instance.current_step_index(),
                "resuming instance"
            );
            if let Err(error) = self.drive(&mut instance, &definition).await {
                tracing::error!(%instance_id, %error, "recovery failed");
                continue;
            }
            resumed.push(instance_id);
        }

        tracing::info!(
            resumed = resumed.len(),
            escalated = self.escalations.len(),
            remediations = self.remediations.len(),
            "recovery finished"
        );
        Ok(resumed)
    }

    /// Applies an operator's decision to an escalated instance.
    ///
    /// `MarkCompensated` treats the failed reversal as done by hand and
    /// continues with any remaining reversals. `Abandon` ends the instance
    /// in FAILED.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_escalation(
        &self,
        instance_id: AggregateId,
        resolution: Resolution,
    ) -> Result<SagaStatus> {
        let _guard = self.lock_instance(instance_id).await;

        let mut instance = self.repository.load_existing(instance_id).await?;
        if !instance.is_escalated() {
            return Err(SagaError::NotEscalated(instance_id));
        }
        let definition = self.definition_for(&instance)?;

        self.repository
            .append(&mut instance, SagaEvent::escalation_resolved(resolution.clone()))
            .await?;
        self.escalations.remove(instance_id);

        match resolution {
            Resolution::MarkCompensated { note } => {
                tracing::info!(%instance_id, %note, "escalation resolved, continuing compensation");
                self.drive(&mut instance, &definition).await?;
            }
            Resolution::Abandon { reason } => {
                tracing::warn!(%instance_id, %reason, "escalated instance abandoned");
                self.repository
                    .append(&mut instance, SagaEvent::saga_failed(reason))
                    .await?;
                metrics::counter!("saga_failed_total", "workflow" => definition.id.clone())
                    .increment(1);
            }
        }
        Ok(instance.status())
    }

    async fn lock_instance(&self, instance_id: AggregateId) -> InstanceGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance_id)
            .or_default()
            .clone();
        // Built before waiting so a dropped waiter still cleans up.
        let mut guard = InstanceGuard {
            locks: &self.locks,
            instance_id,
            lock,
            held: None,
        };
        guard.held = Some(guard.lock.clone().lock_owned().await);
        guard
    }

    /// The definition version the instance started with, even if a newer
    /// one has been published since.
    fn definition_for(&self, instance: &WorkflowInstance) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get(instance.definition_id(), instance.definition_version())
    }

    async fn drive(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<()> {
        loop {
            match instance.status() {
                SagaStatus::Running => {
                    if instance.pending().is_some() {
                        return Ok(());
                    }
                    let index = instance.current_step_index();
                    if index >= definition.steps.len() {
                        self.repository
                            .append(instance, SagaEvent::saga_completed())
                            .await?;
                        self.record_finished(instance, definition);
                        self.finalize(instance, definition.on_completed.as_deref())
                            .await;
                        return Ok(());
                    }
                    let signal = instance.received_signal().cloned();
                    self.run_step(instance, definition, index, signal.as_ref())
                        .await?;
                }
                SagaStatus::Compensating if !instance.is_escalated() => {
                    self.run_compensation(instance, definition).await?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Runs one step to an outcome, retrying transient failures under the
    /// step's policy. With a `signal`, the step's signal handler runs
    /// instead of its forward action.
    async fn run_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        index: usize,
        signal: Option<&SagaSignal>,
    ) -> Result<()> {
        let instance_id = instance
            .id()
            .ok_or_else(|| SagaError::InvalidContext("instance has not started".to_string()))?;
        let step = definition.step_at(index).ok_or_else(|| {
            SagaError::InvalidContext(format!("definition has no step {index}"))
        })?;
        let mut attempt = match signal {
            Some(_) => 1,
            None => instance.attempts_for(index) + 1,
        };

        loop {
            if attempt > step.retry.max_attempts {
                // Attempts were used up before a restart.
                let error = StepError::transient("attempts exhausted before restart");
                return self
                    .begin_compensation(instance, index, step, error, attempt - 1)
                    .await;
            }
            if signal.is_none() {
                self.repository
                    .append(instance, SagaEvent::step_started(index, &step.name, attempt))
                    .await?;
            }
            let context = instance
                .context()
                .cloned()
                .ok_or_else(|| SagaError::InvalidContext("instance has no context".to_string()))?;

            let input = StepInput {
                instance_id,
                step_index: index,
                step_name: &step.name,
                attempt,
                context: &context,
            };
            match self.invoke(step, input, signal).await {
                Ok(StepOutcome::Completed { context, note }) => {
                    tracing::info!(step = %step.name, attempt, "step completed");
                    return self
                        .repository
                        .append(
                            instance,
                            SagaEvent::step_completed(index, &step.name, context, note),
                        )
                        .await;
                }
                Ok(StepOutcome::Pending { context, awaiting }) => {
                    tracing::info!(step = %step.name, ?awaiting, "step awaiting signal");
                    return self
                        .repository
                        .append(
                            instance,
                            SagaEvent::step_pending(index, &step.name, awaiting, context),
                        )
                        .await;
                }
                Err(error) => {
                    self.repository
                        .append(
                            instance,
                            SagaEvent::step_failed(index, &step.name, attempt, error.clone()),
                        )
                        .await?;

                    if error.is_transient() && step.retry.allows_retry_after(attempt) {
                        let delay = step.retry.delay_for(attempt - 1);
                        tracing::warn!(
                            step = %step.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "step failed, retrying"
                        );
                        metrics::counter!("saga_step_retries_total", "step" => step.name.clone())
                            .increment(1);
                        self.repository
                            .append(
                                instance,
                                SagaEvent::retry_scheduled(index, &step.name, attempt + 1, delay),
                            )
                            .await?;
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return self
                        .begin_compensation(instance, index, step, error, attempt)
                        .await;
                }
            }
        }
    }

    /// One attempt of a step, deduplicated by `(instance, step, attempt
    /// class)` and bounded by the step timeout. A timeout counts as a
    /// transient failure.
    async fn invoke(
        &self,
        step: &StepDescriptor,
        input: StepInput<'_>,
        signal: Option<&SagaSignal>,
    ) -> std::result::Result<StepOutcome, StepError> {
        let action = self.actions.step(&step.action).ok_or_else(|| {
            StepError::permanent(
                "UNKNOWN_ACTION",
                format!("no step action registered as {}", step.action),
            )
        })?;

        let class = match signal {
            Some(signal) => format!("signal:{}", signal.kind()),
            None => "execute".to_string(),
        };
        let key = IdempotencyKey::step(input.instance_id, input.step_index, &class);
        let guard = match self.step_results.check_and_reserve(&key).await {
            Reservation::Cached(cached) => {
                tracing::debug!(step = %step.name, %class, "reusing recorded step outcome");
                return Ok(cached.result);
            }
            Reservation::FirstTime(guard) => guard,
        };

        let call = async {
            match signal {
                Some(signal) => action.on_signal(input, signal).await,
                None => action.execute(input).await,
            }
        };
        let outcome = match step.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(StepError::transient(format!(
                    "step timed out after {}ms",
                    limit.as_millis()
                )))
            }),
            None => call.await,
        };

        // Only final outcomes are replayed; a pending step must see its signal.
        if let Ok(result) = &outcome
            && matches!(result, StepOutcome::Completed { .. })
        {
            guard.complete(result.clone());
        }
        outcome
    }

    async fn begin_compensation(
        &self,
        instance: &mut WorkflowInstance,
        index: usize,
        step: &StepDescriptor,
        error: StepError,
        attempts: u32,
    ) -> Result<()> {
        let (code, message) = match &error {
            StepError::Permanent { code, message } => (code.clone(), message.clone()),
            StepError::Transient(message) => {
                let exhausted = SagaError::RetriesExhausted {
                    step: step.name.clone(),
                    attempts,
                };
                tracing::warn!(error = %exhausted, last_error = %message, "giving up on step");
                (error.code().to_string(), message.clone())
            }
        };
        tracing::warn!(step = %step.name, %code, "step failed, compensating");

        let failure = SagaFailure {
            step_index: index,
            step_name: step.name.clone(),
            code,
            message,
        };
        self.repository
            .append(instance, SagaEvent::compensation_started(failure))
            .await
    }

    async fn run_compensation(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<()> {
        let instance_id = instance
            .id()
            .ok_or_else(|| SagaError::InvalidContext("instance has not started".to_string()))?;
        let result = self.compensator.compensate(instance, definition).await?;

        if result.success || definition.compensation_strategy == CompensationStrategy::BestEffort
        {
            let unreversed: Vec<String> = result
                .failures
                .iter()
                .map(|failure| failure.step_name.clone())
                .collect();
            if !unreversed.is_empty() {
                tracing::warn!(%instance_id, ?unreversed, "compensated with unreversed steps");
            }
            self.repository
                .append(instance, SagaEvent::saga_compensated(unreversed))
                .await?;
            for failure in &result.failures {
                self.remediate(Remediation {
                    instance_id,
                    step: failure.step_name.clone(),
                    reason: failure.error.to_string(),
                    recorded_at: Utc::now(),
                });
            }
            self.record_finished(instance, definition);
            self.finalize(instance, definition.on_compensated.as_deref())
                .await;
            return Ok(());
        }

        let failed_step = result.failed_step.clone().unwrap_or_default();
        let error = result.error.clone().unwrap_or_default();
        let failure = SagaError::CompensationFailed {
            step: failed_step.clone(),
            error: error.clone(),
        };
        tracing::error!(%instance_id, error = %failure, "escalating for manual intervention");

        self.repository
            .append(
                instance,
                SagaEvent::compensation_escalated(&failed_step, &error),
            )
            .await?;
        self.escalations.push(Escalation {
            instance_id,
            failed_step,
            error,
            escalated_at: Utc::now(),
        });
        metrics::counter!("saga_escalated_total", "workflow" => definition.id.clone())
            .increment(1);
        Ok(())
    }

    fn requeue_escalation(&self, instance_id: AggregateId, instance: &WorkflowInstance) {
        let error = instance
            .compensation_failures()
            .last()
            .map(|failure| failure.error.to_string())
            .unwrap_or_default();
        self.escalations.push(Escalation {
            instance_id,
            failed_step: instance
                .failed_compensation_step()
                .unwrap_or_default()
                .to_string(),
            error,
            escalated_at: instance.updated_at(),
        });
    }

    fn requeue_remediations(&self, instance_id: AggregateId, instance: &WorkflowInstance) {
        for step in instance.unreversed() {
            let reason = instance
                .compensation_failures()
                .iter()
                .find(|failure| &failure.step_name == step)
                .map(|failure| failure.error.to_string())
                .unwrap_or_default();
            self.remediations.push(Remediation {
                instance_id,
                step: step.clone(),
                reason,
                recorded_at: instance.updated_at(),
            });
        }
    }

    fn remediate(&self, remediation: Remediation) {
        tracing::error!(
            instance_id = %remediation.instance_id,
            step = %remediation.step,
            reason = %remediation.reason,
            "manual remediation required"
        );
        if self.remediations.push(remediation) {
            metrics::counter!("saga_remediations_total").increment(1);
        }
    }

    fn record_finished(&self, instance: &WorkflowInstance, definition: &WorkflowDefinition) {
        let elapsed = (Utc::now() - instance.created_at()).num_milliseconds() as f64 / 1000.0;
        let outcome = instance.status().as_str();
        if instance.status() == SagaStatus::Completed {
            metrics::counter!("saga_completed_total", "workflow" => definition.id.clone()).increment(1);
        } else {
            metrics::counter!("saga_compensated_total", "workflow" => definition.id.clone())
                .increment(1);
        }
        metrics::histogram!("saga_duration_seconds", "workflow" => definition.id.clone())
            .record(elapsed);
        tracing::info!(instance_id = ?instance.id(), status = outcome, elapsed_secs = elapsed, "workflow finished");
    }

    /// Finalizers are side effects on collaborators; a failure is logged
    /// and does not change the instance.
    async fn finalize(&self, instance: &WorkflowInstance, name: Option<&str>) {
        let Some(name) = name else {
            return;
        };
        let Some(finalizer) = self.actions.finalizer(name) else {
            tracing::warn!(finalizer = name, "finalizer not registered");
            return;
        };
        if let Err(error) = finalizer.finalize(instance).await {
            tracing::warn!(finalizer = name, %error, "finalizer failed");
        }
    }
}

/// Routes accepted payment webhooks to the instance waiting on them.
#[async_trait]
impl PaymentEventSink for SagaExecutor {
    async fn on_payment_event(
        &self,
        payment: &PaymentRecord,
        event: &CanonicalPaymentEvent,
    ) -> std::result::Result<(), WebhookError> {
        let Some(instance_id) = payment.correlation_id else {
            tracing::debug!(reference = %payment.reference, "payment has no workflow instance");
            return Ok(());
        };
        let downstream = |e: SagaError| WebhookError::Downstream(e.to_string());

        let _guard = self.lock_instance(instance_id).await;
        let instance = self
            .repository
            .load_existing(instance_id)
            .await
            .map_err(downstream)?;

        // Money taken for an instance that gave up on it stays with the
        // merchant until someone refunds it.
        let captured_too_late = event.status == PaymentOutcome::Success
            && payment.status == PaymentStatus::Paid
            && matches!(
                instance.status(),
                SagaStatus::Compensating | SagaStatus::Compensated | SagaStatus::Failed
            )
            && !instance.has_accepted(SignalKind::PaymentSucceeded);
        if captured_too_late {
            self.remediate(Remediation {
                instance_id,
                step: LATE_CAPTURE_STEP.to_string(),
                reason: format!(
                    "payment {} of {} captured after instance was {}",
                    payment.reference,
                    payment.amount,
                    instance.status()
                ),
                recorded_at: Utc::now(),
            });
            return Ok(());
        }

        let status = self
            .deliver(instance_id, SagaSignal::from_payment_event(event))
            .await
            .map_err(downstream)?;
        tracing::debug!(%instance_id, %status, "payment signal delivered");
        Ok(())
    }
}
