use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// In-memory event store.
///
/// Events live in a single append-ordered log behind a tokio `RwLock`; the
/// write lock makes the version check and the append one atomic step.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_new_version = events[0].version;

        let mut store = self.events.write().await;

        let current_version = store
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                expected = %expected,
                actual = %current_version,
                "append rejected: stale version"
            );
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current_version,
            });
        }

        // Unique (aggregate_id, version) constraint.
        if first_new_version != current_version.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(Version::initial());
        let count = events.len() as u64;
        store.extend(events);

        metrics::counter!("events_appended_total").increment(count);

        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        let mut events: Vec<_> = store
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        Ok(store
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let store = self.events.read().await;
        Ok(store
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max())
    }

    async fn list_aggregates(&self, aggregate_type: &str) -> Result<Vec<AggregateId>> {
        let store = self.events.read().await;
        Ok(store
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.version == Version::first())
            .map(|e| e.aggregate_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_event(
        aggregate_id: AggregateId,
        version: Version,
        event_type: &str,
    ) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("TestAggregate")
            .event_type(event_type)
            .version(version)
            .payload_raw(serde_json::json!({"test": true}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let event = create_test_event(aggregate_id, Version::first(), "TestEvent");

        let result = store.append(vec![event], AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), Version::first());

        let events = store.get_events_for_aggregate(aggregate_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_multiple_events() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let events = vec![
            create_test_event(aggregate_id, Version::new(1), "Event1"),
            create_test_event(aggregate_id, Version::new(2), "Event2"),
            create_test_event(aggregate_id, Version::new(3), "Event3"),
        ];

        let result = store.append(events, AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), Version::new(3));
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn empty_append_is_rejected() {
        let store = InMemoryEventStore::new();
        let result = store.append(vec![], AppendOptions::new()).await;
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[tokio::test]
    async fn gap_in_batch_is_rejected() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let events = vec![
            create_test_event(aggregate_id, Version::new(1), "Event1"),
            create_test_event(aggregate_id, Version::new(3), "Event3"),
        ];
        let result = store.append(events, AppendOptions::new()).await;
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let event1 = create_test_event(aggregate_id, Version::first(), "Event1");
        store
            .append(vec![event1], AppendOptions::expect_new())
            .await
            .unwrap();

        let event2 = create_test_event(aggregate_id, Version::new(2), "Event2");
        let result = store
            .append(vec![event2], AppendOptions::expect_version(Version::initial()))
            .await;

        let err = result.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn duplicate_version_without_expectation_conflicts() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![create_test_event(aggregate_id, Version::first(), "A")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        let result = store
            .append(
                vec![create_test_event(aggregate_id, Version::first(), "B")],
                AppendOptions::new(),
            )
            .await;
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn append_with_correct_expected_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let event1 = create_test_event(aggregate_id, Version::first(), "Event1");
        store
            .append(vec![event1], AppendOptions::expect_new())
            .await
            .unwrap();

        let event2 = create_test_event(aggregate_id, Version::new(2), "Event2");
        let result = store
            .append(vec![event2], AppendOptions::expect_version(Version::first()))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn get_events_by_type() {
        let store = InMemoryEventStore::new();
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();

        store
            .append(
                vec![create_test_event(id1, Version::first(), "OrderPlaced")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![create_test_event(id2, Version::first(), "OrderCancelled")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![create_test_event(id1, Version::new(2), "OrderPlaced")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(store.get_events_by_type("OrderPlaced").await.unwrap().len(), 2);
        assert_eq!(
            store.get_events_by_type("OrderCancelled").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn list_aggregates_by_type() {
        let store = InMemoryEventStore::new();
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();

        store
            .append(
                vec![
                    create_test_event(id1, Version::new(1), "Event1"),
                    create_test_event(id1, Version::new(2), "Event2"),
                ],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![create_test_event(id2, Version::first(), "Event1")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let ids = store.list_aggregates("TestAggregate").await.unwrap();
        assert_eq!(ids, vec![id1, id2]);
        assert!(store.list_aggregates("Other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_aggregate_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        assert!(store.get_aggregate_version(aggregate_id).await.unwrap().is_none());

        let events = vec![
            create_test_event(aggregate_id, Version::new(1), "Event1"),
            create_test_event(aggregate_id, Version::new(2), "Event2"),
        ];
        store.append(events, AppendOptions::new()).await.unwrap();

        let version = store.get_aggregate_version(aggregate_id).await.unwrap();
        assert_eq!(version, Some(Version::new(2)));
    }
}
