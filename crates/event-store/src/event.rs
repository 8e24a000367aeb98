use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, EventStoreError};

/// Unique identifier for a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of the latest event in a stream; the optimistic-concurrency token.
///
/// A stream with no events is at version 0. The first event is version 1 and
/// every append moves the stream forward by exactly one per event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a stream that has no events yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version of the first event in a stream.
    pub fn first() -> Self {
        Self(1)
    }

    /// The version after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// True when no event has been written yet.
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A persisted event together with the stream coordinates it was written at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// Event name, e.g. `"OrderPlaced"` or `"StepCompleted"`.
    pub event_type: String,

    /// Stream the event belongs to.
    pub aggregate_id: AggregateId,

    /// Kind of stream, e.g. `"Order"` or `"WorkflowInstance"`.
    pub aggregate_type: String,

    /// Version of the stream after this event.
    pub version: Version,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// Serialized event body.
    pub payload: serde_json::Value,

    /// Free-form metadata (correlation ids, actor, ...).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Starts building an envelope.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Deserializes the payload into a concrete event type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventStoreError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Builder for [`EventEnvelope`].
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Overrides the timestamp. Defaults to now.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Serializes `payload` into the envelope body.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EventStoreError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the envelope, reporting the first missing required field.
    pub fn build(self) -> Result<EventEnvelope, EventStoreError> {
        Ok(EventEnvelope {
            event_id: EventId::new(),
            event_type: self
                .event_type
                .ok_or(EventStoreError::InvalidEnvelope("event_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventStoreError::InvalidEnvelope("aggregate_id"))?,
            aggregate_type: self
                .aggregate_type
                .ok_or(EventStoreError::InvalidEnvelope("aggregate_type"))?,
            version: self
                .version
                .ok_or(EventStoreError::InvalidEnvelope("version"))?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self
                .payload
                .ok_or(EventStoreError::InvalidEnvelope("payload"))?,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_sequence() {
        assert!(Version::initial().is_initial());
        assert_eq!(Version::initial().next(), Version::first());
        assert!(Version::new(1) < Version::new(2));
    }

    #[test]
    fn builder_sets_all_fields() {
        let aggregate_id = AggregateId::new();
        let envelope = EventEnvelope::builder()
            .event_type("OrderPlaced")
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .version(Version::first())
            .payload_raw(serde_json::json!({"total": 2350}))
            .metadata("actor", serde_json::json!("customer"))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type, "OrderPlaced");
        assert_eq!(envelope.aggregate_id, aggregate_id);
        assert_eq!(envelope.version, Version::first());
        assert_eq!(envelope.metadata["actor"], serde_json::json!("customer"));
    }

    #[test]
    fn builder_reports_missing_field() {
        let err = EventEnvelope::builder()
            .event_type("OrderPlaced")
            .build()
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidEnvelope("aggregate_id")));
    }

    #[test]
    fn decode_reads_payload() {
        let envelope = EventEnvelope::builder()
            .event_type("Test")
            .aggregate_id(AggregateId::new())
            .aggregate_type("Test")
            .version(Version::first())
            .payload(&vec![1, 2, 3])
            .unwrap()
            .build()
            .unwrap();
        let decoded: Vec<i32> = envelope.decode().unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }
}
