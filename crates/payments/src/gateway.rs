//! Outbound calls to a payment gateway.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::{Money, VendorId};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::provider::ProviderId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub reference: String,
    pub order_id: AggregateId,
    pub provider: ProviderId,
    pub amount: Money,
    pub currency: String,
}

/// Acknowledgement that a charge was initiated. The outcome arrives later
/// by webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub reference: String,
    pub provider_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub provider_refund_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub settlement_id: String,
}

/// Status of a transaction as the gateway records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayTransactionStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl std::fmt::Display for GatewayTransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatewayTransactionStatus::Pending => "PENDING",
            GatewayTransactionStatus::Succeeded => "SUCCEEDED",
            GatewayTransactionStatus::Failed => "FAILED",
            GatewayTransactionStatus::Refunded => "REFUNDED",
        };
        f.write_str(s)
    }
}

/// The gateway's authoritative record of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub reference: String,
    pub provider_transaction_id: String,
    pub amount: Money,
    pub currency: String,
    pub status: GatewayTransactionStatus,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, GatewayError>;

    async fn refund(&self, reference: &str, amount: Money) -> Result<RefundReceipt, GatewayError>;

    /// Pays captured funds out to the vendor.
    async fn settle(
        &self,
        reference: &str,
        vendor_id: VendorId,
        amount: Money,
    ) -> Result<SettlementReceipt, GatewayError>;

    async fn fetch_transaction(&self, reference: &str) -> Result<GatewayTransaction, GatewayError>;
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    transactions: HashMap<String, GatewayTransaction>,
    refunds: Vec<(String, Money)>,
    settlements: Vec<(String, VendorId, Money)>,
    next_id: u32,
    decline_charges: Option<String>,
    unavailable_charges: u32,
    reject_refunds: bool,
}

/// In-memory gateway for tests and local runs. Charges stay `Pending`
/// until [`complete`](Self::complete) or [`fail`](Self::fail) plays the
/// provider's part.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<RwLock<InMemoryGatewayState>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryGatewayState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryGatewayState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declines every subsequent charge with `reason`.
    pub fn set_decline_charges(&self, reason: Option<&str>) {
        self.write().decline_charges = reason.map(str::to_string);
    }

    /// The next `count` charges fail as unavailable.
    pub fn set_unavailable_charges(&self, count: u32) {
        self.write().unavailable_charges = count;
    }

    pub fn set_reject_refunds(&self, reject: bool) {
        self.write().reject_refunds = reject;
    }

    /// Marks a charge succeeded on the gateway side.
    pub fn complete(&self, reference: &str) {
        self.set_status(reference, GatewayTransactionStatus::Succeeded);
    }

    /// Marks a charge failed on the gateway side.
    pub fn fail(&self, reference: &str) {
        self.set_status(reference, GatewayTransactionStatus::Failed);
    }

    /// Changes the amount the gateway reports for a transaction.
    pub fn override_amount(&self, reference: &str, amount: Money) {
        if let Some(tx) = self.write().transactions.get_mut(reference) {
            tx.amount = amount;
        }
    }

    /// Drops a transaction from the gateway's records.
    pub fn forget(&self, reference: &str) {
        self.write().transactions.remove(reference);
    }

    pub fn transaction(&self, reference: &str) -> Option<GatewayTransaction> {
        self.read().transactions.get(reference).cloned()
    }

    pub fn charge_count(&self) -> usize {
        self.read().transactions.len()
    }

    pub fn refund_count(&self) -> usize {
        self.read().refunds.len()
    }

    pub fn refunded_amount(&self, reference: &str) -> Money {
        self.read()
            .refunds
            .iter()
            .filter(|(r, _)| r == reference)
            .map(|(_, amount)| *amount)
            .sum()
    }

    pub fn settlement_count(&self) -> usize {
        self.read().settlements.len()
    }

    fn set_status(&self, reference: &str, status: GatewayTransactionStatus) {
        if let Some(tx) = self.write().transactions.get_mut(reference) {
            tx.status = status;
            tx.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let mut state = self.write();

        if state.unavailable_charges > 0 {
            state.unavailable_charges -= 1;
            return Err(GatewayError::Unavailable("connection reset".to_string()));
        }
        if let Some(reason) = &state.decline_charges {
            return Err(GatewayError::Declined(reason.clone()));
        }
        // Re-initiating the same reference returns the original charge.
        if let Some(existing) = state.transactions.get(&request.reference) {
            return Ok(ChargeReceipt {
                reference: existing.reference.clone(),
                provider_transaction_id: existing.provider_transaction_id.clone(),
            });
        }

        state.next_id += 1;
        let provider_transaction_id = format!("{}-TX-{:05}", request.provider, state.next_id);
        state.transactions.insert(
            request.reference.clone(),
            GatewayTransaction {
                reference: request.reference.clone(),
                provider_transaction_id: provider_transaction_id.clone(),
                amount: request.amount,
                currency: request.currency,
                status: GatewayTransactionStatus::Pending,
                updated_at: Utc::now(),
            },
        );

        Ok(ChargeReceipt {
            reference: request.reference,
            provider_transaction_id,
        })
    }

    async fn refund(&self, reference: &str, amount: Money) -> Result<RefundReceipt, GatewayError> {
        let mut state = self.write();

        if state.reject_refunds {
            return Err(GatewayError::RefundRejected(reference.to_string()));
        }
        let tx = state
            .transactions
            .get_mut(reference)
            .ok_or_else(|| GatewayError::NotFound(reference.to_string()))?;
        if tx.status != GatewayTransactionStatus::Succeeded {
            return Err(GatewayError::RefundRejected(format!(
                "{reference} is {}",
                tx.status
            )));
        }
        tx.status = GatewayTransactionStatus::Refunded;
        tx.updated_at = Utc::now();

        state.refunds.push((reference.to_string(), amount));
        Ok(RefundReceipt {
            provider_refund_id: format!("RF-{:05}", state.refunds.len()),
        })
    }

    async fn settle(
        &self,
        reference: &str,
        vendor_id: VendorId,
        amount: Money,
    ) -> Result<SettlementReceipt, GatewayError> {
        let mut state = self.write();
        if !state.transactions.contains_key(reference) {
            return Err(GatewayError::NotFound(reference.to_string()));
        }
        state
            .settlements
            .push((reference.to_string(), vendor_id, amount));
        Ok(SettlementReceipt {
            settlement_id: format!("ST-{:05}", state.settlements.len()),
        })
    }

    async fn fetch_transaction(&self, reference: &str) -> Result<GatewayTransaction, GatewayError> {
        self.read()
            .transactions
            .get(reference)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(reference.to_string()))
    }
}
