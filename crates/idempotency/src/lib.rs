//! At-most-once bookkeeping for externally triggered operations.
//!
//! Payment webhooks are redelivered, and workflow steps get retried. Both
//! derive an [`IdempotencyKey`] and pass through an [`IdempotencyStore`] so
//! the side effect behind the key runs once.

mod key;
mod store;

pub use key::IdempotencyKey;
pub use store::{CachedResult, DEFAULT_TTL_DAYS, IdempotencyStore, Reservation, ReservationGuard};
