//! Webhook ingestion: authenticate, normalize, deduplicate, forward.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use idempotency::{IdempotencyKey, IdempotencyStore, Reservation};

use crate::adapter::{CardAdapter, EcoCashAdapter, GatewayAdapter};
use crate::config::PaymentsConfig;
use crate::error::WebhookError;
use crate::event::CanonicalPaymentEvent;
use crate::ledger::{PaymentLedger, PaymentRecord};
use crate::provider::ProviderId;

/// Consumer of accepted payment events, typically the saga executor.
///
/// Called at most once per distinct notification. An error releases the
/// notification so a provider redelivery can retry it.
#[async_trait]
pub trait PaymentEventSink: Send + Sync {
    async fn on_payment_event(
        &self,
        payment: &PaymentRecord,
        event: &CanonicalPaymentEvent,
    ) -> Result<(), WebhookError>;
}

/// Result of an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub event: CanonicalPaymentEvent,
    /// True when the notification had already been processed; `event` is
    /// then the result recorded the first time.
    pub duplicate: bool,
}

pub struct WebhookIngestor {
    adapters: HashMap<ProviderId, Arc<dyn GatewayAdapter>>,
    ledger: Arc<dyn PaymentLedger>,
    processed: IdempotencyStore<CanonicalPaymentEvent>,
    sink: Arc<dyn PaymentEventSink>,
}

impl WebhookIngestor {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        processed: IdempotencyStore<CanonicalPaymentEvent>,
        sink: Arc<dyn PaymentEventSink>,
    ) -> Self {
        Self {
            adapters: HashMap::new(),
            ledger,
            processed,
            sink,
        }
    }

    /// An ingestor with the EcoCash and card adapters keyed by the
    /// configured secrets.
    pub fn from_config(
        config: &PaymentsConfig,
        ledger: Arc<dyn PaymentLedger>,
        processed: IdempotencyStore<CanonicalPaymentEvent>,
        sink: Arc<dyn PaymentEventSink>,
    ) -> Self {
        Self::new(ledger, processed, sink)
            .with_adapter(Arc::new(EcoCashAdapter::new(
                config.webhook_secret(ProviderId::EcoCash).clone(),
            )))
            .with_adapter(Arc::new(CardAdapter::new(
                config.webhook_secret(ProviderId::Card).clone(),
            )))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn adapter(&self, provider: ProviderId) -> Option<&Arc<dyn GatewayAdapter>> {
        self.adapters.get(&provider)
    }

    /// Processes one webhook delivery.
    ///
    /// Rejections (`InvalidSignature`, `MalformedPayload`, unknown
    /// reference) have no side effects. A redelivery of an already
    /// processed notification returns the first result with
    /// `duplicate: true` and does not reach the sink again.
    #[tracing::instrument(skip(self, raw, signature), fields(bytes = raw.len()))]
    pub async fn ingest(
        &self,
        raw: &[u8],
        signature: &str,
        provider: ProviderId,
    ) -> Result<IngestOutcome, WebhookError> {
        let result = self.process(raw, signature, provider).await;

        let outcome = match &result {
            Ok(o) if o.duplicate => "duplicate",
            Ok(_) => "processed",
            Err(e) => e.outcome(),
        };
        metrics::counter!(
            "webhooks_received_total",
            "provider" => provider.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        if let Err(e) = &result {
            tracing::warn!(%provider, error = %e, "webhook rejected");
        }
        result
    }

    async fn process(
        &self,
        raw: &[u8],
        signature: &str,
        provider: ProviderId,
    ) -> Result<IngestOutcome, WebhookError> {
        let adapter = self
            .adapters
            .get(&provider)
            .ok_or(WebhookError::UnsupportedProvider(provider))?;

        adapter.verify_signature(raw, signature)?;
        let event = adapter.parse(raw)?;

        let payment = self
            .ledger
            .get(&event.reference)
            .await?
            .ok_or_else(|| WebhookError::UnknownReference(event.reference.clone()))?;
        if payment.amount != event.amount || payment.currency != event.currency {
            tracing::warn!(
                reference = %event.reference,
                expected = %payment.amount,
                reported = %event.amount,
                "webhook amount differs from initiated charge"
            );
        }

        let key = IdempotencyKey::webhook(provider.as_str(), &event.reference, event.status.as_str());
        let guard = match self.processed.check_and_reserve(&key).await {
            Reservation::Cached(cached) => {
                tracing::info!(reference = %event.reference, first_seen_at = %cached.first_seen_at, "duplicate webhook");
                return Ok(IngestOutcome {
                    event: cached.result,
                    duplicate: true,
                });
            }
            Reservation::FirstTime(guard) => guard,
        };

        // An early return drops the guard, releasing the key for a redelivery.
        let payment = self.ledger.apply_webhook(&event).await?;
        self.sink.on_payment_event(&payment, &event).await?;

        tracing::info!(
            reference = %event.reference,
            status = %event.status,
            webhook_count = payment.webhook_count,
            "payment webhook processed"
        );
        let cached = guard.complete(event);
        Ok(IngestOutcome {
            event: cached.result,
            duplicate: false,
        })
    }
}
