//! Delivery service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::AggregateId;
use thiserror::Error;

use crate::error::StepError;

/// A driver assigned to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAssignment {
    pub delivery_id: String,
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no driver available")]
    NoDriverAvailable,

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("delivery service rejected the request: {0}")]
    Rejected(String),
}

impl From<DeliveryError> for StepError {
    fn from(e: DeliveryError) -> Self {
        match e {
            // Drivers come back online; worth waiting for.
            DeliveryError::NoDriverAvailable => StepError::transient(e.to_string()),
            DeliveryError::UnknownDelivery(_) => {
                StepError::permanent("DELIVERY_NOT_FOUND", e.to_string())
            }
            DeliveryError::Rejected(_) => StepError::permanent("DELIVERY_REJECTED", e.to_string()),
        }
    }
}

#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn assign(&self, order_id: AggregateId) -> Result<DeliveryAssignment, DeliveryError>;

    async fn cancel_assignment(&self, delivery_id: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Default)]
struct InMemoryDeliveryState {
    assignments: HashMap<String, AggregateId>,
    next_id: u32,
    assign_calls: u32,
    no_driver_calls: u32,
    fail_on_cancel: bool,
}

/// In-memory delivery service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeliveryService {
    state: Arc<RwLock<InMemoryDeliveryState>>,
}

impl InMemoryDeliveryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `calls` assign calls find no driver.
    pub fn set_no_driver_calls(&self, calls: u32) {
        self.write().no_driver_calls = calls;
    }

    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.write().fail_on_cancel = fail;
    }

    pub fn active_count(&self) -> usize {
        self.read().assignments.len()
    }

    pub fn has_assignment(&self, delivery_id: &str) -> bool {
        self.read().assignments.contains_key(delivery_id)
    }

    pub fn assign_calls(&self) -> u32 {
        self.read().assign_calls
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryDeliveryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryDeliveryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeliveryService for InMemoryDeliveryService {
    async fn assign(&self, order_id: AggregateId) -> Result<DeliveryAssignment, DeliveryError> {
        let mut state = self.write();
        state.assign_calls += 1;
        if state.no_driver_calls > 0 {
            state.no_driver_calls -= 1;
            return Err(DeliveryError::NoDriverAvailable);
        }

        state.next_id += 1;
        let delivery_id = format!("DLV-{:04}", state.next_id);
        let driver_id = format!("DRV-{:03}", (state.next_id - 1) % 50 + 1);
        state.assignments.insert(delivery_id.clone(), order_id);

        Ok(DeliveryAssignment {
            delivery_id,
            driver_id,
        })
    }

    async fn cancel_assignment(&self, delivery_id: &str) -> Result<(), DeliveryError> {
        let mut state = self.write();
        if state.fail_on_cancel {
            return Err(DeliveryError::Rejected(
                "driver already picked up".to_string(),
            ));
        }
        state
            .assignments
            .remove(delivery_id)
            .map(|_| ())
            .ok_or_else(|| DeliveryError::UnknownDelivery(delivery_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_and_cancel() {
        let service = InMemoryDeliveryService::new();
        let assignment = service.assign(AggregateId::new()).await.unwrap();
        assert_eq!(assignment.delivery_id, "DLV-0001");
        assert_eq!(assignment.driver_id, "DRV-001");
        assert!(service.has_assignment("DLV-0001"));

        service.cancel_assignment("DLV-0001").await.unwrap();
        assert_eq!(service.active_count(), 0);
        assert_eq!(
            service.cancel_assignment("DLV-0001").await,
            Err(DeliveryError::UnknownDelivery("DLV-0001".to_string()))
        );
    }

    #[tokio::test]
    async fn test_no_driver_is_transient() {
        let service = InMemoryDeliveryService::new();
        service.set_no_driver_calls(1);

        let err = service.assign(AggregateId::new()).await.unwrap_err();
        assert!(StepError::from(err).is_transient());
        assert!(service.assign(AggregateId::new()).await.is_ok());
        assert_eq!(service.assign_calls(), 2);
    }
}
