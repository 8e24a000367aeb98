//! Notification service trait and in-memory implementation.
//!
//! Notifications are fire-and-forget from the workflow's point of view:
//! a failed send is logged by the caller and never fails a step.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use domain::{CustomerId, VendorId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Customer(CustomerId),
    Vendor(VendorId),
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Customer(id) => write!(f, "customer:{id}"),
            Recipient::Vendor(id) => write!(f, "vendor:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReceipt {
    Delivered,
    /// Accepted for later delivery, e.g. the chat channel is rate limited.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification to {recipient} failed: {reason}")]
pub struct NotificationError {
    pub recipient: Recipient,
    pub reason: String,
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(
        &self,
        recipient: Recipient,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<NotificationReceipt, NotificationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: Recipient,
    pub event_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<SentNotification>,
    fail_all: bool,
}

/// Records every notification instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_all = fail;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }

    /// Event types sent to `recipient`, in order.
    pub fn events_for(&self, recipient: Recipient) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient == recipient)
            .map(|n| n.event_type)
            .collect()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn notify(
        &self,
        recipient: Recipient,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<NotificationReceipt, NotificationError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.fail_all {
            return Err(NotificationError {
                recipient,
                reason: "channel unavailable".to_string(),
            });
        }
        state.sent.push(SentNotification {
            recipient,
            event_type: event_type.to_string(),
            data,
        });
        Ok(NotificationReceipt::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_notifications() {
        let service = InMemoryNotificationService::new();
        let customer = Recipient::Customer(CustomerId::new());
        let vendor = Recipient::Vendor(VendorId::new());

        service
            .notify(customer, "order_confirmed", serde_json::json!({"total": "$23.50"}))
            .await
            .unwrap();
        service
            .notify(vendor, "new_order", serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(service.sent().len(), 2);
        assert_eq!(service.events_for(customer), vec!["order_confirmed"]);
    }

    #[tokio::test]
    async fn test_failure_mode() {
        let service = InMemoryNotificationService::new();
        service.set_fail_all(true);
        let err = service
            .notify(Recipient::Vendor(VendorId::new()), "new_order", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel unavailable"));
        assert!(service.sent().is_empty());
    }
}
