//! Identifiers shared by every layer of the commerce platform.

mod types;

pub use types::AggregateId;
