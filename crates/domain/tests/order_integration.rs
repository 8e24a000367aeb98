//! Integration tests for the Order aggregate.
//!
//! These tests cover the fulfillment lifecycle through the service, replay
//! from the event store, and optimistic concurrency between writers.

use std::sync::Arc;

use common::AggregateId;
use domain::{
    Aggregate, CustomerId, DomainError, Money, OrderError, OrderItem, OrderService, OrderStatus,
    OrderTrigger, PaymentStatus, PlaceOrder, RecordPayment, TenantId, UpdateStatus, VendorId,
};
use event_store::{EventStore, InMemoryEventStore, Version};

fn create_service() -> OrderService<InMemoryEventStore> {
    OrderService::new(InMemoryEventStore::new())
}

fn lunch_order() -> PlaceOrder {
    PlaceOrder::new(
        TenantId::new("harare-eats"),
        CustomerId::new(),
        VendorId::new(),
        vec![
            OrderItem::new("SKU-BURGER", "Burger", 1, Money::from_cents(1500)),
            OrderItem::new("SKU-CHIPS", "Chips", 2, Money::from_cents(425)),
        ],
        "USD",
    )
}

mod order_lifecycle {
    use super::*;

    #[tokio::test]
    async fn delivery_path_with_versioned_updates() {
        let service = create_service();
        let cmd = lunch_order();
        let order_id = cmd.order_id;

        let result = service.place_order(cmd).await.unwrap();
        assert_eq!(result.aggregate.status(), OrderStatus::Pending);
        assert_eq!(result.aggregate.total_amount(), "23.50".parse::<Money>().unwrap());

        let mut version = result.new_version;
        for (trigger, expected) in [
            (OrderTrigger::Confirm, OrderStatus::Confirmed),
            (OrderTrigger::StartPreparing, OrderStatus::Preparing),
            (OrderTrigger::MarkReady, OrderStatus::Ready),
            (OrderTrigger::PickUp, OrderStatus::OutForDelivery),
            (OrderTrigger::Deliver, OrderStatus::Delivered),
        ] {
            let result = service
                .update_status(UpdateStatus::new(order_id, version, trigger))
                .await
                .unwrap();
            assert_eq!(result.aggregate.status(), expected);
            assert_eq!(result.new_version, version.next());
            version = result.new_version;
        }

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert!(order.is_terminal());
        assert_eq!(order.available_transitions(), vec![OrderTrigger::Refund]);
    }

    #[tokio::test]
    async fn aggregate_reconstruction_from_events() {
        let store = InMemoryEventStore::new();
        let service = OrderService::new(store.clone());
        let cmd = lunch_order();
        let order_id = cmd.order_id;

        service.place_order(cmd).await.unwrap();
        service
            .record_payment(RecordPayment::new(
                order_id,
                PaymentStatus::Paid,
                Some("ECO-77".to_string()),
            ))
            .await
            .unwrap();
        service
            .apply_trigger(order_id, OrderTrigger::Confirm, None)
            .await
            .unwrap();

        let events = store.get_events_for_aggregate(order_id).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["OrderPlaced", "OrderPaymentRecorded", "OrderStatusChanged"]
        );

        // A fresh service over the same store sees the same state.
        let replayed = OrderService::new(store)
            .get_order(order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.status(), OrderStatus::Confirmed);
        assert_eq!(replayed.payment_status(), PaymentStatus::Paid);
        assert_eq!(replayed.payment_reference(), Some("ECO-77"));
        assert_eq!(replayed.version(), Version::new(3));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_writers_on_same_version_one_wins() {
        let service = Arc::new(create_service());
        let cmd = lunch_order();
        let order_id = cmd.order_id;
        let read_version = service.place_order(cmd).await.unwrap().new_version;

        let vendor = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .update_status(UpdateStatus::new(order_id, read_version, OrderTrigger::Confirm))
                    .await
            })
        };
        let customer = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .update_status(
                        UpdateStatus::new(order_id, read_version, OrderTrigger::Cancel)
                            .with_reason("CUSTOMER_REQUEST"),
                    )
                    .await
            })
        };

        let results = [vendor.await.unwrap(), customer.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.version(), read_version.next());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retrying_writers_both_land() {
        let service = Arc::new(create_service());
        let cmd = lunch_order();
        let order_id = cmd.order_id;
        service.place_order(cmd).await.unwrap();

        let confirm = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .apply_trigger(order_id, OrderTrigger::Confirm, None)
                    .await
            })
        };
        let pay = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .record_payment(RecordPayment::new(order_id, PaymentStatus::Paid, None))
                    .await
            })
        };

        confirm.await.unwrap().unwrap();
        pay.await.unwrap().unwrap();

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Confirmed);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert_eq!(order.version(), Version::new(3));
    }
}

mod error_handling {
    use super::*;

    #[tokio::test]
    async fn invalid_transition_leaves_order_unchanged() {
        let service = create_service();
        let cmd = lunch_order();
        let order_id = cmd.order_id;
        service.place_order(cmd).await.unwrap();

        let result = service
            .update_status(UpdateStatus::new(order_id, Version::first(), OrderTrigger::PickUp))
            .await;
        assert!(matches!(
            result,
            Err(DomainError::Order(OrderError::InvalidTransition {
                from: OrderStatus::Pending,
                trigger: OrderTrigger::PickUp
            }))
        ));

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.version(), Version::first());
    }

    #[tokio::test]
    async fn cannot_cancel_out_for_delivery() {
        let service = create_service();
        let cmd = lunch_order();
        let order_id = cmd.order_id;
        service.place_order(cmd).await.unwrap();

        for trigger in [
            OrderTrigger::Confirm,
            OrderTrigger::StartPreparing,
            OrderTrigger::MarkReady,
            OrderTrigger::PickUp,
        ] {
            service.apply_trigger(order_id, trigger, None).await.unwrap();
        }

        let result = service
            .apply_trigger(order_id, OrderTrigger::Cancel, Some("TOO_LATE".to_string()))
            .await;
        assert!(matches!(
            result,
            Err(DomainError::Order(OrderError::InvalidTransition { .. }))
        ));
    }

    #[tokio::test]
    async fn cannot_place_empty_order() {
        let service = create_service();
        let mut cmd = lunch_order();
        cmd.items.clear();

        let result = service.place_order(cmd).await;
        assert!(matches!(result, Err(DomainError::Order(OrderError::NoItems))));
    }

    #[tokio::test]
    async fn commands_on_missing_order_fail() {
        let service = create_service();
        let result = service
            .apply_trigger(AggregateId::new(), OrderTrigger::Confirm, None)
            .await;
        assert!(matches!(result, Err(DomainError::Order(OrderError::NotPlaced))));
    }
}
