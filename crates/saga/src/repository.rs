//! Persistence of workflow instances as event streams.

use std::sync::Arc;

use common::AggregateId;
use domain::{Aggregate, DomainEvent};
use event_store::{AppendOptions, EventEnvelope, EventStore, Version};

use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::instance::WorkflowInstance;

/// Loads instances by replay and appends events with an expected-version
/// check, so two writers on one stream can never both succeed.
#[derive(Clone)]
pub struct InstanceRepository {
    store: Arc<dyn EventStore>,
}

impl InstanceRepository {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Replays the stream. Returns None if the instance doesn't exist.
    pub async fn load(&self, instance_id: AggregateId) -> Result<Option<WorkflowInstance>> {
        let envelopes = self.store.get_events_for_aggregate(instance_id).await?;
        if envelopes.is_empty() {
            return Ok(None);
        }

        let mut instance = WorkflowInstance::default();
        for envelope in envelopes {
            let event: SagaEvent = envelope.decode()?;
            instance.apply(event);
            instance.set_version(envelope.version);
        }
        Ok(Some(instance))
    }

    pub async fn load_existing(&self, instance_id: AggregateId) -> Result<WorkflowInstance> {
        self.load(instance_id)
            .await?
            .ok_or(SagaError::InstanceNotFound(instance_id))
    }

    /// Starts a new stream with `SagaStarted`.
    pub async fn create(&self, started: SagaEvent) -> Result<WorkflowInstance> {
        let instance_id = match &started {
            SagaEvent::SagaStarted(data) => data.instance_id,
            other => {
                return Err(SagaError::InvalidContext(format!(
                    "a workflow stream must start with SagaStarted, not {}",
                    other.event_type()
                )));
            }
        };
        let mut instance = WorkflowInstance::default();
        let version = self
            .write(instance_id, Version::initial(), &started)
            .await?;
        instance.apply(started);
        instance.set_version(version);
        Ok(instance)
    }

    /// Appends one event at the instance's current version and folds it in.
    pub async fn append(&self, instance: &mut WorkflowInstance, event: SagaEvent) -> Result<()> {
        let instance_id = instance
            .id()
            .ok_or_else(|| SagaError::InvalidContext("instance has not started".to_string()))?;
        let version = self.write(instance_id, instance.version(), &event).await?;
        instance.apply(event);
        instance.set_version(version);
        Ok(())
    }

    /// Every instance ever started, oldest first.
    pub async fn list_ids(&self) -> Result<Vec<AggregateId>> {
        Ok(self
            .store
            .list_aggregates(WorkflowInstance::aggregate_type())
            .await?)
    }

    /// Raw stream, for audit and tests.
    pub async fn events(&self, instance_id: AggregateId) -> Result<Vec<SagaEvent>> {
        self.store
            .get_events_for_aggregate(instance_id)
            .await?
            .iter()
            .map(|envelope| envelope.decode().map_err(SagaError::from))
            .collect()
    }

    async fn write(
        &self,
        instance_id: AggregateId,
        current_version: Version,
        event: &SagaEvent,
    ) -> Result<Version> {
        let envelope = EventEnvelope::builder()
            .event_type(event.event_type())
            .aggregate_id(instance_id)
            .aggregate_type(WorkflowInstance::aggregate_type())
            .version(current_version.next())
            .payload(event)?
            .build()?;

        Ok(self
            .store
            .append(vec![envelope], AppendOptions::expect_version(current_version))
            .await?)
    }
}
