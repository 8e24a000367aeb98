//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use domain::ProductId;
use thiserror::Error;

use crate::error::StepError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    #[error("inventory service unavailable: {0}")]
    Unavailable(String),
}

impl From<InventoryError> for StepError {
    fn from(e: InventoryError) -> Self {
        match e {
            InventoryError::InsufficientStock { .. } => {
                StepError::permanent("INSUFFICIENT_STOCK", e.to_string())
            }
            InventoryError::Unavailable(_) => StepError::transient(e.to_string()),
        }
    }
}

/// Per-product stock counters.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Takes `quantity` units, or fails without taking any.
    async fn reserve(&self, product_id: &ProductId, quantity: u32) -> Result<(), InventoryError>;

    /// Returns previously reserved units.
    async fn release(&self, product_id: &ProductId, quantity: u32) -> Result<(), InventoryError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<ProductId, Arc<AtomicU32>>,
    unavailable_reserves: u32,
    fail_on_release: bool,
}

/// In-memory inventory with atomic per-product counters.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stock(&self, product_id: impl Into<ProductId>, quantity: u32) {
        self.write()
            .stock
            .insert(product_id.into(), Arc::new(AtomicU32::new(quantity)));
    }

    pub fn available(&self, product_id: impl Into<ProductId>) -> u32 {
        self.counter(&product_id.into())
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// The next `calls` reserve calls fail as unavailable.
    pub fn set_unavailable_reserves(&self, calls: u32) {
        self.write().unavailable_reserves = calls;
    }

    pub fn set_fail_on_release(&self, fail: bool) {
        self.write().fail_on_release = fail;
    }

    fn counter(&self, product_id: &ProductId) -> Option<Arc<AtomicU32>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stock
            .get(product_id)
            .cloned()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, product_id: &ProductId, quantity: u32) -> Result<(), InventoryError> {
        {
            let mut state = self.write();
            if state.unavailable_reserves > 0 {
                state.unavailable_reserves -= 1;
                return Err(InventoryError::Unavailable(
                    "inventory backend timed out".to_string(),
                ));
            }
        }

        let counter = self
            .counter(product_id)
            .ok_or_else(|| InventoryError::InsufficientStock {
                product_id: product_id.clone(),
                requested: quantity,
                available: 0,
            })?;

        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |available| {
                available.checked_sub(quantity)
            })
            .map(|_| ())
            .map_err(|available| InventoryError::InsufficientStock {
                product_id: product_id.clone(),
                requested: quantity,
                available,
            })
    }

    async fn release(&self, product_id: &ProductId, quantity: u32) -> Result<(), InventoryError> {
        if self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_release
        {
            return Err(InventoryError::Unavailable(
                "inventory backend rejected release".to_string(),
            ));
        }
        match self.counter(product_id) {
            Some(counter) => {
                counter.fetch_add(quantity, Ordering::SeqCst);
            }
            None => self.set_stock(product_id.clone(), quantity),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 5);
        let product = ProductId::new("SKU-001");

        service.reserve(&product, 2).await.unwrap();
        assert_eq!(service.available("SKU-001"), 3);

        service.release(&product, 2).await.unwrap();
        assert_eq!(service.available("SKU-001"), 5);
    }

    #[tokio::test]
    async fn test_insufficient_stock_takes_nothing() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 1);

        let err = service
            .reserve(&ProductId::new("SKU-001"), 2)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                product_id: ProductId::new("SKU-001"),
                requested: 2,
                available: 1,
            }
        );
        assert_eq!(service.available("SKU-001"), 1);
        assert!(!StepError::from(err).is_transient());
    }

    #[tokio::test]
    async fn test_unknown_product_has_no_stock() {
        let service = InMemoryInventoryService::new();
        assert!(matches!(
            service.reserve(&ProductId::new("SKU-404"), 1).await,
            Err(InventoryError::InsufficientStock { available: 0, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_oversell() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 10);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.reserve(&ProductId::new("SKU-001"), 1).await.is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(service.available("SKU-001"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 1);
        service.set_unavailable_reserves(1);

        let err = service.reserve(&ProductId::new("SKU-001"), 1).await.unwrap_err();
        assert!(StepError::from(err).is_transient());
        service.reserve(&ProductId::new("SKU-001"), 1).await.unwrap();
    }
}
