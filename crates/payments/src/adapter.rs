//! Gateway-specific webhook formats.
//!
//! An adapter authenticates a raw delivery and translates it into a
//! [`CanonicalPaymentEvent`]. Everything downstream of the adapter is
//! provider-neutral.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use domain::Money;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;

use crate::error::WebhookError;
use crate::event::{CanonicalPaymentEvent, PaymentOutcome};
use crate::provider::ProviderId;
use crate::secret::Secret;

type HmacSha256 = Hmac<Sha256>;

pub trait GatewayAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Authenticates `raw` against the provider's signature header.
    fn verify_signature(&self, raw: &[u8], signature_header: &str) -> Result<(), WebhookError>;

    fn parse(&self, raw: &[u8]) -> Result<CanonicalPaymentEvent, WebhookError>;

    /// Produces the header value the provider would send for `raw`.
    fn sign(&self, raw: &[u8]) -> String;
}

/// Base64 HMAC-SHA256 of `raw` under `secret`.
pub fn hmac_base64(secret: &Secret<String>, raw: &[u8]) -> String {
    // HMAC takes keys of any length, and an empty signature never verifies.
    match HmacSha256::new_from_slice(secret.reveal().as_bytes()) {
        Ok(mut mac) => {
            mac.update(raw);
            BASE64.encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// Constant-time check of a base64 HMAC-SHA256 signature.
fn verify_hmac(secret: &Secret<String>, raw: &[u8], signature_b64: &str) -> Result<(), WebhookError> {
    if secret.reveal().is_empty() {
        return Err(WebhookError::InvalidSignature);
    }
    let signature = BASE64
        .decode(signature_b64.trim())
        .map_err(|_| WebhookError::InvalidSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret.reveal().as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(raw);
    mac.verify_slice(&signature)
        .map_err(|_| WebhookError::InvalidSignature)
}

fn malformed(e: impl std::fmt::Display) -> WebhookError {
    WebhookError::MalformedPayload(e.to_string())
}

/// Accepts `"23.50"` as well as a bare JSON number.
fn decimal_amount<'de, D>(deserializer: D) -> Result<Money, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    let text = match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    };
    text.parse().map_err(serde::de::Error::custom)
}

/// EcoCash mobile money. The signature header carries the base64
/// HMAC-SHA256 of the body.
#[derive(Debug, Clone)]
pub struct EcoCashAdapter {
    secret: Secret<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcoCashPayload {
    source_reference: String,
    transaction_status: String,
    #[serde(deserialize_with = "decimal_amount")]
    amount: Money,
    currency: String,
    ecocash_reference: String,
    timestamp: Option<DateTime<Utc>>,
    reason_code: Option<String>,
}

impl EcoCashAdapter {
    pub fn new(secret: Secret<String>) -> Self {
        Self { secret }
    }
}

impl GatewayAdapter for EcoCashAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::EcoCash
    }

    fn verify_signature(&self, raw: &[u8], signature_header: &str) -> Result<(), WebhookError> {
        verify_hmac(&self.secret, raw, signature_header)
    }

    fn parse(&self, raw: &[u8]) -> Result<CanonicalPaymentEvent, WebhookError> {
        let payload: EcoCashPayload = serde_json::from_slice(raw).map_err(malformed)?;
        let status = match payload.transaction_status.to_ascii_uppercase().as_str() {
            "COMPLETED" | "SUCCESS" => PaymentOutcome::Success,
            "FAILED" => PaymentOutcome::Failed,
            "EXPIRED" | "TIMEOUT" => PaymentOutcome::Timeout,
            other => return Err(malformed(format!("unknown transactionStatus {other}"))),
        };

        Ok(CanonicalPaymentEvent {
            provider: ProviderId::EcoCash,
            reference: payload.source_reference,
            status,
            amount: payload.amount,
            currency: payload.currency,
            provider_transaction_id: payload.ecocash_reference,
            timestamp: payload.timestamp.unwrap_or_else(Utc::now),
            failure_reason: payload.reason_code,
        })
    }

    fn sign(&self, raw: &[u8]) -> String {
        hmac_base64(&self.secret, raw)
    }
}

/// Card processor. Header is `sha256=<base64 HMAC>`; the charge sits under
/// a `data` object keyed by event type.
#[derive(Debug, Clone)]
pub struct CardAdapter {
    secret: Secret<String>,
}

const CARD_SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Deserialize)]
struct CardPayload {
    #[serde(rename = "type")]
    event_type: String,
    data: CardCharge,
}

#[derive(Debug, Deserialize)]
struct CardCharge {
    id: String,
    reference: String,
    #[serde(deserialize_with = "decimal_amount")]
    amount: Money,
    currency: String,
    created_at: Option<DateTime<Utc>>,
    failure_code: Option<String>,
}

impl CardAdapter {
    pub fn new(secret: Secret<String>) -> Self {
        Self { secret }
    }
}

impl GatewayAdapter for CardAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Card
    }

    fn verify_signature(&self, raw: &[u8], signature_header: &str) -> Result<(), WebhookError> {
        let signature = signature_header
            .trim()
            .strip_prefix(CARD_SIGNATURE_PREFIX)
            .ok_or(WebhookError::InvalidSignature)?;
        verify_hmac(&self.secret, raw, signature)
    }

    fn parse(&self, raw: &[u8]) -> Result<CanonicalPaymentEvent, WebhookError> {
        let payload: CardPayload = serde_json::from_slice(raw).map_err(malformed)?;
        let status = match payload.event_type.as_str() {
            "charge.succeeded" => PaymentOutcome::Success,
            "charge.failed" => PaymentOutcome::Failed,
            "charge.expired" => PaymentOutcome::Timeout,
            other => return Err(malformed(format!("unsupported event type {other}"))),
        };
        let charge = payload.data;

        Ok(CanonicalPaymentEvent {
            provider: ProviderId::Card,
            reference: charge.reference,
            status,
            amount: charge.amount,
            currency: charge.currency.to_ascii_uppercase(),
            provider_transaction_id: charge.id,
            timestamp: charge.created_at.unwrap_or_else(Utc::now),
            failure_reason: charge.failure_code.map(|c| c.to_ascii_uppercase()),
        })
    }

    fn sign(&self, raw: &[u8]) -> String {
        format!("{CARD_SIGNATURE_PREFIX}{}", hmac_base64(&self.secret, raw))
    }
}
