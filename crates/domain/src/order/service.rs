//! Order service providing the API the saga and actor-facing callers use.

use common::AggregateId;
use event_store::EventStore;

use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{
    CompleteRefund, Order, OrderError, OrderEvent, OrderTrigger, PlaceOrder, RecordPayment,
    RequestRefund, UpdateStatus,
};

/// Attempts used by [`OrderService`] writes that re-read on conflict.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

/// Service for managing orders.
pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
}

impl<S: EventStore> OrderService<S> {
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<CommandResult<Order>, DomainError> {
        let PlaceOrder {
            order_id,
            tenant_id,
            customer_id,
            vendor_id,
            items,
            currency,
        } = cmd;

        let result = self
            .handler
            .execute(order_id, |order| {
                order.place(order_id, tenant_id, customer_id, vendor_id, items, currency)
            })
            .await?;

        metrics::counter!("orders_placed_total").increment(1);
        tracing::info!(total = %result.aggregate.total_amount(), "order placed");
        Ok(result)
    }

    /// Compare-and-append status change.
    ///
    /// Fails with a concurrency conflict if the order is no longer at
    /// `cmd.expected_version`; the caller must re-read before retrying.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        cmd: UpdateStatus,
    ) -> Result<CommandResult<Order>, DomainError> {
        let UpdateStatus {
            order_id,
            expected_version,
            trigger,
            reason,
        } = cmd;

        let result = self
            .handler
            .execute_at(order_id, expected_version, |order| {
                order.apply_trigger(trigger, reason)
            })
            .await;

        if let Err(e) = &result
            && e.is_conflict()
        {
            metrics::counter!("order_version_conflicts_total").increment(1);
            tracing::warn!(%order_id, %expected_version, "stale order version");
        }
        result
    }

    /// Read-modify-write with retry on version conflicts.
    ///
    /// `decide` is re-run against a freshly loaded order after every
    /// conflict. Domain rejections are returned immediately.
    pub async fn modify_with_retry<F>(
        &self,
        order_id: AggregateId,
        max_attempts: u32,
        decide: F,
    ) -> Result<CommandResult<Order>, DomainError>
    where
        F: Fn(&Order) -> Result<Vec<OrderEvent>, OrderError>,
    {
        let mut attempt = 1;
        loop {
            match self.handler.execute(order_id, |order| decide(order)).await {
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    tracing::warn!(%order_id, attempt, "order write conflicted, re-reading");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Applies a trigger to the latest version of the order.
    #[tracing::instrument(skip(self))]
    pub async fn apply_trigger(
        &self,
        order_id: AggregateId,
        trigger: OrderTrigger,
        reason: Option<String>,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.modify_with_retry(order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
            order.apply_trigger(trigger, reason.clone())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_payment(
        &self,
        cmd: RecordPayment,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.modify_with_retry(cmd.order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
            order.record_payment(cmd.status, cmd.reference.clone())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn request_refund(
        &self,
        cmd: RequestRefund,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.modify_with_retry(cmd.order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
            order.request_refund(cmd.amount)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_refund(
        &self,
        cmd: CompleteRefund,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.modify_with_retry(cmd.order_id, DEFAULT_WRITE_ATTEMPTS, |order| {
            order.complete_refund(cmd.provider_refund_id.clone())
        })
        .await
    }

    /// Loads an order by ID. Returns None if the order doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>, DomainError> {
        self.handler.load_existing(order_id).await
    }
}
