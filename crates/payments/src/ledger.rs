//! Local record of every payment we initiated.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Money, PaymentStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::event::{CanonicalPaymentEvent, PaymentOutcome};
use crate::provider::ProviderId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub reference: String,
    pub order_id: AggregateId,
    /// Workflow instance waiting on this payment, if any.
    pub correlation_id: Option<AggregateId>,
    pub provider: ProviderId,
    pub amount: Money,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Webhooks applied to this record. Redeliveries are absorbed before
    /// they reach the ledger, so this counts distinct notifications.
    pub webhook_count: u32,
    pub provider_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// A freshly initiated payment, awaiting the gateway's verdict.
    pub fn pending(
        reference: impl Into<String>,
        order_id: AggregateId,
        provider: ProviderId,
        amount: Money,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            reference: reference.into(),
            order_id,
            correlation_id: None,
            provider,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Pending,
            provider_transaction_id: None,
            failure_reason: None,
            webhook_count: 0,
            provider_refund_id: None,
            created_at: Utc::now(),
            completed_at: None,
            refunded_at: None,
        }
    }

    pub fn correlated_with(mut self, instance_id: AggregateId) -> Self {
        self.correlation_id = Some(instance_id);
        self
    }

    /// Generates a reference to send to the gateway.
    pub fn new_reference() -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("PAY-{}", id[..12].to_ascii_uppercase())
    }
}

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn record_initiated(&self, record: PaymentRecord) -> Result<()>;

    async fn get(&self, reference: &str) -> Result<Option<PaymentRecord>>;

    /// Latest payment recorded for an order.
    async fn find_by_order(&self, order_id: AggregateId) -> Result<Option<PaymentRecord>>;

    /// Folds a gateway notification into the record and bumps
    /// `webhook_count`. Re-applying the notification that produced the
    /// current state changes nothing.
    async fn apply_webhook(&self, event: &CanonicalPaymentEvent) -> Result<PaymentRecord>;

    async fn mark_refunded(
        &self,
        reference: &str,
        provider_refund_id: Option<String>,
    ) -> Result<PaymentRecord>;

    /// Paid or refunded payments whose charge completed in `[from, to)`.
    async fn completed_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>>;
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<String, PaymentRecord>,
    by_order: HashMap<AggregateId, String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn record_initiated(&self, record: PaymentRecord) -> Result<()> {
        let mut state = self.write();
        if state.records.contains_key(&record.reference) {
            return Err(PaymentError::DuplicateReference(record.reference));
        }
        state
            .by_order
            .insert(record.order_id, record.reference.clone());
        state.records.insert(record.reference.clone(), record);
        Ok(())
    }

    async fn get(&self, reference: &str) -> Result<Option<PaymentRecord>> {
        Ok(self.read().records.get(reference).cloned())
    }

    async fn find_by_order(&self, order_id: AggregateId) -> Result<Option<PaymentRecord>> {
        let state = self.read();
        Ok(state
            .by_order
            .get(&order_id)
            .and_then(|reference| state.records.get(reference))
            .cloned())
    }

    async fn apply_webhook(&self, event: &CanonicalPaymentEvent) -> Result<PaymentRecord> {
        let mut state = self.write();
        let record = state
            .records
            .get_mut(&event.reference)
            .ok_or_else(|| PaymentError::NotFound(event.reference.clone()))?;

        let next = match event.status {
            PaymentOutcome::Success => PaymentStatus::Paid,
            PaymentOutcome::Failed | PaymentOutcome::Timeout => PaymentStatus::Failed,
        };

        if record.status == next
            && record.provider_transaction_id.as_deref() == Some(event.provider_transaction_id.as_str())
        {
            return Ok(record.clone());
        }

        if record.status.can_move_to(next) {
            record.status = next;
        } else if record.status != next {
            tracing::warn!(
                reference = %event.reference,
                from = %record.status,
                to = %next,
                "ignoring payment status regression"
            );
        }

        record.webhook_count += 1;
        record.provider_transaction_id = Some(event.provider_transaction_id.clone());
        match event.status {
            PaymentOutcome::Success => {
                record.failure_reason = None;
                record.completed_at.get_or_insert(event.timestamp);
            }
            PaymentOutcome::Failed => {
                record.failure_reason = event.failure_reason.clone();
            }
            PaymentOutcome::Timeout => {
                record.failure_reason = Some(
                    event
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| PaymentOutcome::Timeout.to_string()),
                );
            }
        }

        Ok(record.clone())
    }

    async fn mark_refunded(
        &self,
        reference: &str,
        provider_refund_id: Option<String>,
    ) -> Result<PaymentRecord> {
        let mut state = self.write();
        let record = state
            .records
            .get_mut(reference)
            .ok_or_else(|| PaymentError::NotFound(reference.to_string()))?;

        match record.status {
            PaymentStatus::Refunded => {}
            PaymentStatus::Paid => {
                record.status = PaymentStatus::Refunded;
                record.provider_refund_id = provider_refund_id;
                record.refunded_at = Some(Utc::now());
            }
            other => {
                return Err(PaymentError::NotRefundable {
                    reference: reference.to_string(),
                    status: other.to_string(),
                });
            }
        }
        Ok(record.clone())
    }

    async fn completed_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentRecord>> {
        let mut records: Vec<_> = self
            .read()
            .records
            .values()
            .filter(|r| matches!(r.status, PaymentStatus::Paid | PaymentStatus::Refunded))
            .filter(|r| r.completed_at.is_some_and(|at| at >= from && at < to))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.completed_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn pending(reference: &str) -> PaymentRecord {
        PaymentRecord::pending(
            reference,
            AggregateId::new(),
            ProviderId::EcoCash,
            Money::from_cents(2350),
            "USD",
        )
    }

    fn webhook(reference: &str, status: PaymentOutcome) -> CanonicalPaymentEvent {
        CanonicalPaymentEvent {
            provider: ProviderId::EcoCash,
            reference: reference.to_string(),
            status,
            amount: Money::from_cents(2350),
            currency: "USD".to_string(),
            provider_transaction_id: "MP-1".to_string(),
            timestamp: Utc::now(),
            failure_reason: None,
        }
    }

    #[test]
    fn references_are_unique() {
        let a = PaymentRecord::new_reference();
        assert!(a.starts_with("PAY-"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, PaymentRecord::new_reference());
    }

    #[tokio::test]
    async fn duplicate_reference_rejected() {
        let ledger = InMemoryPaymentLedger::new();
        ledger.record_initiated(pending("PAY-1")).await.unwrap();
        assert!(matches!(
            ledger.record_initiated(pending("PAY-1")).await,
            Err(PaymentError::DuplicateReference(_))
        ));
    }

    #[tokio::test]
    async fn success_webhook_marks_paid_once() {
        let ledger = InMemoryPaymentLedger::new();
        let record = pending("PAY-1");
        let order_id = record.order_id;
        ledger.record_initiated(record).await.unwrap();

        let event = webhook("PAY-1", PaymentOutcome::Success);
        let updated = ledger.apply_webhook(&event).await.unwrap();
        assert_eq!(updated.status, PaymentStatus::Paid);
        assert_eq!(updated.webhook_count, 1);
        assert!(updated.completed_at.is_some());

        // Replaying the same notification is absorbed.
        let again = ledger.apply_webhook(&event).await.unwrap();
        assert_eq!(again.webhook_count, 1);

        let by_order = ledger.find_by_order(order_id).await.unwrap().unwrap();
        assert_eq!(by_order.reference, "PAY-1");
    }

    #[tokio::test]
    async fn failure_after_success_does_not_regress() {
        let ledger = InMemoryPaymentLedger::new();
        ledger.record_initiated(pending("PAY-1")).await.unwrap();
        ledger
            .apply_webhook(&webhook("PAY-1", PaymentOutcome::Success))
            .await
            .unwrap();

        let mut failed = webhook("PAY-1", PaymentOutcome::Failed);
        failed.provider_transaction_id = "MP-2".to_string();
        let record = ledger.apply_webhook(&failed).await.unwrap();
        assert_eq!(record.status, PaymentStatus::Paid);
        assert_eq!(record.webhook_count, 2);
    }

    #[tokio::test]
    async fn timeout_records_reason() {
        let ledger = InMemoryPaymentLedger::new();
        ledger.record_initiated(pending("PAY-1")).await.unwrap();
        let record = ledger
            .apply_webhook(&webhook("PAY-1", PaymentOutcome::Timeout))
            .await
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn refund_requires_paid() {
        let ledger = InMemoryPaymentLedger::new();
        ledger.record_initiated(pending("PAY-1")).await.unwrap();
        assert!(matches!(
            ledger.mark_refunded("PAY-1", None).await,
            Err(PaymentError::NotRefundable { .. })
        ));

        ledger
            .apply_webhook(&webhook("PAY-1", PaymentOutcome::Success))
            .await
            .unwrap();
        let record = ledger
            .mark_refunded("PAY-1", Some("RF-1".to_string()))
            .await
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Refunded);
        assert_eq!(record.provider_refund_id.as_deref(), Some("RF-1"));

        // Idempotent.
        assert!(ledger.mark_refunded("PAY-1", None).await.is_ok());
    }

    #[tokio::test]
    async fn completed_between_filters_by_window_and_status() {
        let ledger = InMemoryPaymentLedger::new();
        ledger.record_initiated(pending("PAY-1")).await.unwrap();
        ledger.record_initiated(pending("PAY-2")).await.unwrap();
        ledger
            .apply_webhook(&webhook("PAY-1", PaymentOutcome::Success))
            .await
            .unwrap();

        let now = Utc::now();
        let window = ledger
            .completed_between(now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].reference, "PAY-1");

        let earlier = ledger
            .completed_between(now - Duration::hours(2), now - Duration::hours(1))
            .await
            .unwrap();
        assert!(earlier.is_empty());
    }
}
