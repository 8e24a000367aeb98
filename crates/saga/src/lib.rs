//! Orchestrated sagas for order fulfillment and refunds.
//!
//! Workflows are plain data ([`WorkflowDefinition`]) whose steps name
//! actions registered in an [`ActionRegistry`]. The [`SagaExecutor`] runs
//! instances as event-sourced aggregates: every step start, outcome,
//! signal and reversal is an event, so a restarted process resumes each
//! instance from its stream.
//!
//! The fulfillment workflow:
//! 1. Reserve inventory
//! 2. Charge payment, then wait for the gateway's webhook
//! 3. Notify the vendor, then wait for acceptance
//! 4. Assign delivery
//! 5. Settle funds with the vendor
//!
//! If any step fails for good, completed steps are reversed newest first
//! according to the definition's [`CompensationStrategy`].

pub mod compensation;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod instance;
pub mod order_fulfillment;
pub mod refund;
pub mod registry;
pub mod repository;
pub mod services;
pub mod signal;

pub use compensation::{
    CompensationCoordinator, CompensationResult, Escalation, EscalationQueue, Remediation,
    RemediationList, Reversal,
};
pub use config::SagaConfig;
pub use context::{ContextKind, FulfillmentContext, RefundContext, ReservedLine, WorkflowContext};
pub use definition::{CompensationStrategy, RetryPolicy, StepDescriptor, WorkflowDefinition};
pub use error::{SagaError, StepError};
pub use events::{Resolution, SagaEvent, SagaFailure};
pub use executor::{CANCELLED_CODE, LATE_CAPTURE_STEP, SagaExecutor};
pub use instance::{HistoryEntry, PendingStep, ReversalFailure, SagaStatus, WorkflowInstance};
pub use order_fulfillment::FulfillmentDeps;
pub use registry::{
    ActionRegistry, CompensationAction, DefinitionRegistry, Finalizer, StepAction, StepInput,
    StepOutcome,
};
pub use repository::InstanceRepository;
pub use services::{
    DeliveryAssignment, DeliveryError, DeliveryService, InMemoryDeliveryService,
    InMemoryInventoryService, InMemoryNotificationService, InventoryError, InventoryService,
    NotificationError, NotificationReceipt, NotificationService, Recipient, SentNotification,
};
pub use signal::{SagaSignal, SignalKind};
