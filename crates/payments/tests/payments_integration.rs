//! Integration tests for webhook ingestion and reconciliation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use common::AggregateId;
use domain::{Money, PaymentStatus};
use idempotency::IdempotencyStore;
use payments::{
    CanonicalPaymentEvent, ChargeRequest, DiscrepancyKind, GatewayAdapter, InMemoryAlertSink,
    InMemoryGateway, InMemoryPaymentLedger, PaymentEventSink, PaymentGateway, PaymentLedger,
    PaymentRecord, PaymentsConfig, ProviderId, ReconciliationPeriod, Reconciler, Secret,
    Severity, WebhookError, WebhookIngestor,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct CountingSink {
    calls: AtomicUsize,
}

#[async_trait]
impl PaymentEventSink for CountingSink {
    async fn on_payment_event(
        &self,
        _payment: &PaymentRecord,
        _event: &CanonicalPaymentEvent,
    ) -> Result<(), WebhookError> {
        // Widen the race window between concurrent deliveries.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestHarness {
    ingestor: Arc<WebhookIngestor>,
    ledger: InMemoryPaymentLedger,
    gateway: InMemoryGateway,
    sink: Arc<CountingSink>,
    alerts: InMemoryAlertSink,
    reconciler: Reconciler,
}

impl TestHarness {
    fn new() -> Self {
        init_tracing();
        let config = PaymentsConfig {
            ecocash_webhook_secret: Secret::new("eco-secret".to_string()),
            card_webhook_secret: Secret::new("card-secret".to_string()),
            ..Default::default()
        };
        let ledger = InMemoryPaymentLedger::new();
        let gateway = InMemoryGateway::new();
        let sink = Arc::new(CountingSink::default());
        let alerts = InMemoryAlertSink::new();

        let ingestor = WebhookIngestor::from_config(
            &config,
            Arc::new(ledger.clone()),
            IdempotencyStore::default(),
            sink.clone(),
        );
        let reconciler = Reconciler::new(
            Arc::new(ledger.clone()),
            Arc::new(gateway.clone()),
            Arc::new(alerts.clone()),
            config.thresholds,
        );

        Self {
            ingestor: Arc::new(ingestor),
            ledger,
            gateway,
            sink,
            alerts,
            reconciler,
        }
    }

    /// Initiates a charge and records it locally, as the saga does.
    async fn charge(&self, provider: ProviderId, cents: i64) -> String {
        let reference = PaymentRecord::new_reference();
        let order_id = AggregateId::new();
        self.gateway
            .initiate_charge(ChargeRequest {
                reference: reference.clone(),
                order_id,
                provider,
                amount: Money::from_cents(cents),
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
        self.ledger
            .record_initiated(PaymentRecord::pending(
                &reference,
                order_id,
                provider,
                Money::from_cents(cents),
                "USD",
            ))
            .await
            .unwrap();
        reference
    }

    fn signed(&self, provider: ProviderId, raw: &[u8]) -> String {
        self.ingestor.adapter(provider).unwrap().sign(raw)
    }

    /// Settles the charge at the gateway and delivers the success webhook.
    async fn settle(&self, provider: ProviderId, reference: &str, amount: &str) {
        self.gateway.complete(reference);
        let raw = match provider {
            ProviderId::EcoCash => ecocash_body(reference, "COMPLETED", amount),
            ProviderId::Card => card_body(reference, "charge.succeeded", amount),
        };
        let sig = self.signed(provider, &raw);
        self.ingestor.ingest(&raw, &sig, provider).await.unwrap();
    }
}

fn ecocash_body(reference: &str, status: &str, amount: &str) -> Vec<u8> {
    format!(
        r#"{{"sourceReference":"{reference}","transactionStatus":"{status}","amount":"{amount}","currency":"USD","ecocashReference":"MP-{reference}","timestamp":"2026-01-01T12:00:00Z"}}"#
    )
    .into_bytes()
}

fn card_body(reference: &str, event_type: &str, amount: &str) -> Vec<u8> {
    format!(
        r#"{{"type":"{event_type}","data":{{"id":"ch_{reference}","reference":"{reference}","amount":"{amount}","currency":"usd"}}}}"#
    )
    .into_bytes()
}

mod ingestion {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeliveries_apply_once() {
        let h = TestHarness::new();
        let reference = h.charge(ProviderId::EcoCash, 2350).await;
        let raw = ecocash_body(&reference, "COMPLETED", "23.50");
        let sig = h.signed(ProviderId::EcoCash, &raw);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let ingestor = h.ingestor.clone();
            let raw = raw.clone();
            let sig = sig.clone();
            handles.push(tokio::spawn(async move {
                ingestor.ingest(&raw, &sig, ProviderId::EcoCash).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| !o.duplicate).count(), 1);
        assert!(outcomes.windows(2).all(|w| w[0].event == w[1].event));
        assert_eq!(h.sink.calls.load(Ordering::SeqCst), 1);

        let record = h.ledger.get(&reference).await.unwrap().unwrap();
        assert_eq!(record.webhook_count, 1);
        assert_eq!(record.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn card_and_ecocash_are_normalized_alike() {
        let h = TestHarness::new();
        let eco = h.charge(ProviderId::EcoCash, 1000).await;
        let card = h.charge(ProviderId::Card, 1000).await;

        let eco_raw = ecocash_body(&eco, "COMPLETED", "10.00");
        let card_raw = card_body(&card, "charge.succeeded", "10");
        let eco_event = h
            .ingestor
            .ingest(&eco_raw, &h.signed(ProviderId::EcoCash, &eco_raw), ProviderId::EcoCash)
            .await
            .unwrap()
            .event;
        let card_event = h
            .ingestor
            .ingest(&card_raw, &h.signed(ProviderId::Card, &card_raw), ProviderId::Card)
            .await
            .unwrap()
            .event;

        assert_eq!(eco_event.status, card_event.status);
        assert_eq!(eco_event.amount, card_event.amount);
        assert_eq!(eco_event.currency, card_event.currency);
    }

    #[tokio::test]
    async fn cross_provider_signature_rejected() {
        let h = TestHarness::new();
        let reference = h.charge(ProviderId::EcoCash, 500).await;
        let raw = ecocash_body(&reference, "COMPLETED", "5.00");
        let card_sig = h.signed(ProviderId::Card, &raw);

        let err = h
            .ingestor
            .ingest(&raw, &card_sig, ProviderId::EcoCash)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
        assert_eq!(h.sink.calls.load(Ordering::SeqCst), 0);
    }
}

mod reconciliation {
    use super::*;
    use std::collections::HashMap;

    use domain::OrderStatus;
    use payments::{OrderStatusLookup, PaymentError, SeverityThresholds};

    struct KnownOrders(HashMap<AggregateId, OrderStatus>);

    #[async_trait]
    impl OrderStatusLookup for KnownOrders {
        async fn order_status(
            &self,
            order_id: AggregateId,
        ) -> Result<Option<OrderStatus>, PaymentError> {
            Ok(self.0.get(&order_id).copied())
        }
    }

    #[tokio::test]
    async fn capture_for_cancelled_order_is_flagged() {
        let h = TestHarness::new();
        let cancelled = h.charge(ProviderId::EcoCash, 2350).await;
        h.settle(ProviderId::EcoCash, &cancelled, "23.50").await;
        let confirmed = h.charge(ProviderId::EcoCash, 1000).await;
        h.settle(ProviderId::EcoCash, &confirmed, "10.00").await;

        let mut statuses = HashMap::new();
        for (reference, status) in [
            (&cancelled, OrderStatus::Cancelled),
            (&confirmed, OrderStatus::Confirmed),
        ] {
            let record = h.ledger.get(reference).await.unwrap().unwrap();
            statuses.insert(record.order_id, status);
        }
        let alerts = InMemoryAlertSink::new();
        let reconciler = Reconciler::new(
            Arc::new(h.ledger.clone()),
            Arc::new(h.gateway.clone()),
            Arc::new(alerts.clone()),
            SeverityThresholds::default(),
        )
        .with_orders(Arc::new(KnownOrders(statuses)));

        let report = reconciler
            .reconcile(ReconciliationPeriod::last_hours(24 * 365 * 5))
            .await
            .unwrap();

        assert_eq!(report.total_transactions, 2);
        assert_eq!(report.reconciled_count, 1);
        assert_eq!(report.discrepancies.len(), 1);
        let flagged = &report.discrepancies[0];
        assert_eq!(flagged.reference, cancelled);
        assert_eq!(
            flagged.kind,
            DiscrepancyKind::CapturedForClosedOrder {
                order_status: OrderStatus::Cancelled
            }
        );
        assert_eq!(flagged.delta, Money::from_cents(2350));
        assert_eq!(flagged.severity, Severity::High);
        assert_eq!(alerts.alerts().len(), 1);

        // Without order lookups the same period looks clean.
        assert!(
            h.reconciler
                .reconcile(ReconciliationPeriod::last_hours(24 * 365 * 5))
                .await
                .unwrap()
                .is_clean()
        );
    }

    #[tokio::test]
    async fn clean_period_reconciles_everything() {
        let h = TestHarness::new();
        for cents in [2350, 1000, 99] {
            let reference = h.charge(ProviderId::EcoCash, cents).await;
            let amount = Money::from_cents(cents).to_decimal_string();
            h.settle(ProviderId::EcoCash, &reference, &amount).await;
        }
        // Still pending: not part of the period.
        h.charge(ProviderId::Card, 700).await;

        let report = h
            .reconciler
            .reconcile(ReconciliationPeriod::last_hours(24 * 365 * 5))
            .await
            .unwrap();
        assert_eq!(report.total_transactions, 3);
        assert_eq!(report.reconciled_count, 3);
        assert!(report.is_clean());
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn mismatches_are_reported_not_corrected() {
        let h = TestHarness::new();
        let short = h.charge(ProviderId::EcoCash, 2350).await;
        h.settle(ProviderId::EcoCash, &short, "23.50").await;
        h.gateway.override_amount(&short, Money::from_cents(2000));

        let missing = h.charge(ProviderId::Card, 15000).await;
        h.settle(ProviderId::Card, &missing, "150.00").await;
        h.gateway.forget(&missing);

        let reversed = h.charge(ProviderId::EcoCash, 1200).await;
        h.settle(ProviderId::EcoCash, &reversed, "12.00").await;
        h.gateway.fail(&reversed);

        let report = h
            .reconciler
            .reconcile(ReconciliationPeriod::last_hours(24 * 365 * 5))
            .await
            .unwrap();

        assert_eq!(report.total_transactions, 3);
        assert_eq!(report.reconciled_count, 0);
        assert_eq!(report.discrepancies.len(), 3);

        let find = |reference: &str| {
            report
                .discrepancies
                .iter()
                .find(|d| d.reference == reference)
                .unwrap()
        };
        let amount = find(&short);
        assert!(matches!(amount.kind, DiscrepancyKind::AmountMismatch { .. }));
        assert_eq!(amount.delta, Money::from_cents(350));
        assert_eq!(amount.severity, Severity::Medium);

        assert_eq!(find(&missing).kind, DiscrepancyKind::MissingAtGateway);
        assert_eq!(find(&missing).severity, Severity::Critical);

        let status = find(&reversed);
        assert!(matches!(status.kind, DiscrepancyKind::StatusMismatch { .. }));
        assert_eq!(status.severity, Severity::High);

        assert_eq!(h.alerts.alerts().len(), 3);

        // The ledger is untouched.
        let record = h.ledger.get(&short).await.unwrap().unwrap();
        assert_eq!(record.amount, Money::from_cents(2350));
        assert_eq!(record.status, PaymentStatus::Paid);
    }
}
