//! Out-of-band comparison of the local ledger against the gateway.
//!
//! Reconciliation only reports. It never writes to the ledger or to
//! orders; every discrepancy is raised through an [`AlertSink`] for an
//! operator to act on. Given an [`OrderStatusLookup`], it also flags money
//! the gateway holds for orders that were cancelled or failed.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Money, OrderService, OrderStatus, PaymentStatus};
use event_store::EventStore;
use serde::{Deserialize, Serialize};

use crate::config::SeverityThresholds;
use crate::error::{GatewayError, PaymentError};
use crate::gateway::{GatewayTransactionStatus, PaymentGateway};
use crate::ledger::{PaymentLedger, PaymentRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ReconciliationPeriod {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The `hours` leading up to now.
    pub fn last_hours(hours: i64) -> Self {
        let to = Utc::now();
        Self {
            from: to - chrono::Duration::hours(hours),
            to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Grades an amount at risk against the configured thresholds.
    pub fn for_delta(delta: Money, thresholds: &SeverityThresholds) -> Self {
        if delta >= thresholds.critical {
            Severity::Critical
        } else if delta >= thresholds.high {
            Severity::High
        } else if delta >= thresholds.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscrepancyKind {
    AmountMismatch {
        local: Money,
        gateway: Money,
    },
    StatusMismatch {
        local: PaymentStatus,
        gateway: GatewayTransactionStatus,
    },
    MissingAtGateway,
    /// Captured and not refunded, but the order will never be fulfilled.
    CapturedForClosedOrder {
        order_status: OrderStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub reference: String,
    pub order_id: AggregateId,
    pub kind: DiscrepancyKind,
    /// Money at risk: the amount delta, or the whole payment when the
    /// status or the record itself disagrees.
    pub delta: Money,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub period: ReconciliationPeriod,
    pub total_transactions: usize,
    pub reconciled_count: usize,
    pub discrepancies: Vec<Discrepancy>,
    /// References the gateway could not be asked about this run.
    pub unverified: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty() && self.unverified.is_empty()
    }
}

/// Read access to order status for reconciliation.
#[async_trait]
pub trait OrderStatusLookup: Send + Sync {
    async fn order_status(&self, order_id: AggregateId) -> Result<Option<OrderStatus>, PaymentError>;
}

#[async_trait]
impl<S: EventStore> OrderStatusLookup for OrderService<S> {
    async fn order_status(&self, order_id: AggregateId) -> Result<Option<OrderStatus>, PaymentError> {
        let order = self
            .get_order(order_id)
            .await
            .map_err(|e| PaymentError::OrderLookup(e.to_string()))?;
        Ok(order.map(|order| order.status()))
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, discrepancy: &Discrepancy);
}

/// Logs discrepancies at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, d: &Discrepancy) {
        tracing::error!(
            reference = %d.reference,
            order_id = %d.order_id,
            severity = d.severity.as_str(),
            delta = %d.delta,
            kind = ?d.kind,
            "payment reconciliation discrepancy"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<Discrepancy>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Discrepancy> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, discrepancy: &Discrepancy) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(discrepancy.clone());
    }
}

pub struct Reconciler {
    ledger: Arc<dyn PaymentLedger>,
    gateway: Arc<dyn PaymentGateway>,
    alerts: Arc<dyn AlertSink>,
    thresholds: SeverityThresholds,
    orders: Option<Arc<dyn OrderStatusLookup>>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        gateway: Arc<dyn PaymentGateway>,
        alerts: Arc<dyn AlertSink>,
        thresholds: SeverityThresholds,
    ) -> Self {
        Self {
            ledger,
            gateway,
            alerts,
            thresholds,
            orders: None,
        }
    }

    /// Also checks captured payments against their order's status.
    pub fn with_orders(mut self, orders: Arc<dyn OrderStatusLookup>) -> Self {
        self.orders = Some(orders);
        self
    }

    /// Compares every payment completed in `period` with the gateway's
    /// record of it.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(
        &self,
        period: ReconciliationPeriod,
    ) -> Result<ReconciliationReport, PaymentError> {
        let payments = self.ledger.completed_between(period.from, period.to).await?;
        let mut report = ReconciliationReport {
            period,
            total_transactions: payments.len(),
            reconciled_count: 0,
            discrepancies: Vec::new(),
            unverified: Vec::new(),
            generated_at: Utc::now(),
        };

        for payment in &payments {
            let kind = match self.gateway.fetch_transaction(&payment.reference).await {
                Ok(tx) => compare(payment, tx.amount, tx.status),
                Err(GatewayError::NotFound(_)) => Some(DiscrepancyKind::MissingAtGateway),
                Err(e) => {
                    tracing::warn!(reference = %payment.reference, error = %e, "gateway lookup failed");
                    report.unverified.push(payment.reference.clone());
                    continue;
                }
            };
            let kind = match kind {
                None => match self.closed_order_capture(payment).await {
                    Ok(kind) => kind,
                    Err(e) => {
                        tracing::warn!(reference = %payment.reference, error = %e, "order lookup failed");
                        report.unverified.push(payment.reference.clone());
                        continue;
                    }
                },
                kind => kind,
            };

            match kind {
                None => report.reconciled_count += 1,
                Some(kind) => {
                    let discrepancy = self.discrepancy(payment, kind);
                    metrics::counter!(
                        "reconciliation_discrepancies_total",
                        "severity" => discrepancy.severity.as_str()
                    )
                    .increment(1);
                    self.alerts.raise(&discrepancy);
                    report.discrepancies.push(discrepancy);
                }
            }
        }

        tracing::info!(
            total = report.total_transactions,
            reconciled = report.reconciled_count,
            discrepancies = report.discrepancies.len(),
            unverified = report.unverified.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn closed_order_capture(
        &self,
        payment: &PaymentRecord,
    ) -> Result<Option<DiscrepancyKind>, PaymentError> {
        let Some(orders) = &self.orders else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Paid {
            return Ok(None);
        }
        let status = orders.order_status(payment.order_id).await?;
        Ok(status
            .filter(|status| matches!(status, OrderStatus::Cancelled | OrderStatus::Failed))
            .map(|order_status| DiscrepancyKind::CapturedForClosedOrder { order_status }))
    }

    fn discrepancy(&self, payment: &PaymentRecord, kind: DiscrepancyKind) -> Discrepancy {
        let (delta, severity) = match &kind {
            DiscrepancyKind::AmountMismatch { local, gateway } => {
                let delta = local.abs_diff(*gateway);
                (delta, Severity::for_delta(delta, &self.thresholds))
            }
            DiscrepancyKind::StatusMismatch { .. } => (
                payment.amount,
                Severity::for_delta(payment.amount, &self.thresholds),
            ),
            DiscrepancyKind::MissingAtGateway => (payment.amount, Severity::Critical),
            DiscrepancyKind::CapturedForClosedOrder { .. } => (
                payment.amount,
                Severity::for_delta(payment.amount, &self.thresholds).max(Severity::High),
            ),
        };
        Discrepancy {
            reference: payment.reference.clone(),
            order_id: payment.order_id,
            kind,
            delta,
            severity,
            detected_at: Utc::now(),
        }
    }
}

fn compare(
    payment: &PaymentRecord,
    gateway_amount: Money,
    gateway_status: GatewayTransactionStatus,
) -> Option<DiscrepancyKind> {
    let status_agrees = matches!(
        (payment.status, gateway_status),
        (PaymentStatus::Paid, GatewayTransactionStatus::Succeeded)
            | (PaymentStatus::Refunded, GatewayTransactionStatus::Refunded)
    );
    if !status_agrees {
        return Some(DiscrepancyKind::StatusMismatch {
            local: payment.status,
            gateway: gateway_status,
        });
    }
    if payment.amount != gateway_amount {
        return Some(DiscrepancyKind::AmountMismatch {
            local: payment.amount,
            gateway: gateway_amount,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> SeverityThresholds {
        SeverityThresholds::default()
    }

    #[test]
    fn severity_grows_with_delta() {
        let t = thresholds();
        assert_eq!(Severity::for_delta(Money::from_cents(1), &t), Severity::Low);
        assert_eq!(Severity::for_delta(Money::from_cents(100), &t), Severity::Medium);
        assert_eq!(Severity::for_delta(Money::from_cents(999), &t), Severity::Medium);
        assert_eq!(Severity::for_delta(Money::from_cents(1_000), &t), Severity::High);
        assert_eq!(Severity::for_delta(Money::from_cents(50_000), &t), Severity::Critical);
        assert!(Severity::Critical > Severity::Low);
    }

    #[test]
    fn matching_paid_record_reconciles() {
        let mut record = crate::ledger::PaymentRecord::pending(
            "PAY-1",
            AggregateId::new(),
            crate::ProviderId::EcoCash,
            Money::from_cents(2350),
            "USD",
        );
        record.status = PaymentStatus::Paid;

        assert_eq!(
            compare(&record, Money::from_cents(2350), GatewayTransactionStatus::Succeeded),
            None
        );
        assert!(matches!(
            compare(&record, Money::from_cents(2300), GatewayTransactionStatus::Succeeded),
            Some(DiscrepancyKind::AmountMismatch { .. })
        ));
        assert!(matches!(
            compare(&record, Money::from_cents(2350), GatewayTransactionStatus::Failed),
            Some(DiscrepancyKind::StatusMismatch { .. })
        ));
    }

    #[test]
    fn in_memory_sink_collects() {
        let sink = InMemoryAlertSink::new();
        sink.raise(&Discrepancy {
            reference: "PAY-1".to_string(),
            order_id: AggregateId::new(),
            kind: DiscrepancyKind::MissingAtGateway,
            delta: Money::from_cents(2350),
            severity: Severity::Critical,
            detected_at: Utc::now(),
        });
        assert_eq!(sink.alerts().len(), 1);
    }
}
