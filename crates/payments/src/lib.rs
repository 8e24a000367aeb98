//! Payment gateways, webhook ingestion and reconciliation.
//!
//! Payment outcomes arrive asynchronously as signed webhooks. A
//! [`WebhookIngestor`] authenticates each delivery with the provider's
//! [`GatewayAdapter`], translates it into a [`CanonicalPaymentEvent`],
//! collapses redeliveries through the idempotency store, records the
//! outcome in the [`PaymentLedger`] and hands it to a [`PaymentEventSink`]
//! exactly once. The [`Reconciler`] later checks the ledger against the
//! gateway and raises alerts on mismatch.

pub mod adapter;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod ingest;
pub mod ledger;
pub mod provider;
pub mod reconcile;
pub mod secret;

pub use adapter::{CardAdapter, EcoCashAdapter, GatewayAdapter, hmac_base64};
pub use config::{PaymentsConfig, SeverityThresholds};
pub use error::{GatewayError, PaymentError, WebhookError};
pub use event::{CanonicalPaymentEvent, PaymentOutcome};
pub use gateway::{
    ChargeReceipt, ChargeRequest, GatewayTransaction, GatewayTransactionStatus, InMemoryGateway,
    PaymentGateway, RefundReceipt, SettlementReceipt,
};
pub use ingest::{IngestOutcome, PaymentEventSink, WebhookIngestor};
pub use ledger::{InMemoryPaymentLedger, PaymentLedger, PaymentRecord};
pub use provider::{ProviderId, UnknownProvider};
pub use reconcile::{
    AlertSink, Discrepancy, DiscrepancyKind, InMemoryAlertSink, OrderStatusLookup,
    ReconciliationPeriod, ReconciliationReport, Reconciler, Severity, TracingAlertSink,
};
pub use secret::Secret;
