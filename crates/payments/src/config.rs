//! Payments configuration loaded from environment variables.

use domain::Money;

use crate::provider::ProviderId;
use crate::secret::Secret;

/// Amount deltas at which a reconciliation discrepancy escalates in severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityThresholds {
    pub medium: Money,
    pub high: Money,
    pub critical: Money,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium: Money::from_cents(100),
            high: Money::from_cents(1_000),
            critical: Money::from_cents(10_000),
        }
    }
}

/// Reads from environment variables:
/// - `ECOCASH_WEBHOOK_SECRET`, `CARD_WEBHOOK_SECRET` (default: empty, which
///   rejects every webhook from that provider)
/// - `RECONCILIATION_MEDIUM_CENTS` (100), `RECONCILIATION_HIGH_CENTS` (1000),
///   `RECONCILIATION_CRITICAL_CENTS` (10000)
#[derive(Debug, Clone, Default)]
pub struct PaymentsConfig {
    pub ecocash_webhook_secret: Secret<String>,
    pub card_webhook_secret: Secret<String>,
    pub thresholds: SeverityThresholds,
}

impl PaymentsConfig {
    pub fn from_env() -> Self {
        let defaults = SeverityThresholds::default();
        Self {
            ecocash_webhook_secret: secret_var("ECOCASH_WEBHOOK_SECRET"),
            card_webhook_secret: secret_var("CARD_WEBHOOK_SECRET"),
            thresholds: SeverityThresholds {
                medium: cents_var("RECONCILIATION_MEDIUM_CENTS").unwrap_or(defaults.medium),
                high: cents_var("RECONCILIATION_HIGH_CENTS").unwrap_or(defaults.high),
                critical: cents_var("RECONCILIATION_CRITICAL_CENTS")
                    .unwrap_or(defaults.critical),
            },
        }
    }

    pub fn webhook_secret(&self, provider: ProviderId) -> &Secret<String> {
        match provider {
            ProviderId::EcoCash => &self.ecocash_webhook_secret,
            ProviderId::Card => &self.card_webhook_secret,
        }
    }
}

fn secret_var(name: &str) -> Secret<String> {
    Secret::new(std::env::var(name).unwrap_or_default())
}

fn cents_var(name: &str) -> Option<Money> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(Money::from_cents)
}
