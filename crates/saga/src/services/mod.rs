//! Collaborator contracts the workflows call, with in-memory implementations.

pub mod delivery;
pub mod inventory;
pub mod notification;

pub use delivery::{DeliveryAssignment, DeliveryError, DeliveryService, InMemoryDeliveryService};
pub use inventory::{InMemoryInventoryService, InventoryError, InventoryService};
pub use notification::{
    InMemoryNotificationService, NotificationError, NotificationReceipt, NotificationService,
    Recipient, SentNotification,
};
