//! Append-only event storage.
//!
//! Orders and workflow instances are both persisted as ordered event streams.
//! Appends carry an expected version so concurrent writers are detected
//! instead of silently overwriting each other.

pub mod error;
pub mod event;
pub mod memory;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use store::{AppendOptions, EventStore, EventStoreExt};
