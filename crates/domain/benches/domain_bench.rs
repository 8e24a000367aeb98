use common::AggregateId;
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{
    Aggregate, CustomerId, Money, Order, OrderEvent, OrderItem, OrderService, OrderStatus,
    OrderTrigger, PaymentStatus, PlaceOrder, TenantId, VendorId,
};
use event_store::{AppendOptions, EventEnvelope, EventStore, InMemoryEventStore, Version};

fn make_envelope(aggregate_id: AggregateId, version: i64, event: &OrderEvent) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("Order")
        .event_type(domain::DomainEvent::event_type(event))
        .version(Version::new(version))
        .payload(event)
        .unwrap()
        .build()
        .unwrap()
}

fn place_order_cmd() -> PlaceOrder {
    PlaceOrder::new(
        TenantId::new("bench"),
        CustomerId::new(),
        VendorId::new(),
        vec![OrderItem::new("SKU-BENCH", "Bench Meal", 2, Money::from_cents(1175))],
        "USD",
    )
}

fn bench_transition_table(c: &mut Criterion) {
    c.bench_function("domain/transition_all_pairs", |b| {
        b.iter(|| {
            let mut legal = 0;
            for status in OrderStatus::ALL {
                for trigger in OrderTrigger::ALL {
                    if std::hint::black_box(status).transition(trigger).is_ok() {
                        legal += 1;
                    }
                }
            }
            legal
        });
    });
}

fn bench_place_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/place_order", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = OrderService::new(InMemoryEventStore::new());
                service.place_order(place_order_cmd()).await.unwrap();
            });
        });
    });
}

fn bench_delivery_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/place_to_delivered", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = OrderService::new(InMemoryEventStore::new());
                let cmd = place_order_cmd();
                let order_id = cmd.order_id;
                service.place_order(cmd).await.unwrap();
                for trigger in [
                    OrderTrigger::Confirm,
                    OrderTrigger::StartPreparing,
                    OrderTrigger::MarkReady,
                    OrderTrigger::PickUp,
                    OrderTrigger::Deliver,
                ] {
                    service.apply_trigger(order_id, trigger, None).await.unwrap();
                }
            });
        });
    });
}

fn bench_aggregate_reconstruction(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let agg_id = AggregateId::new();

    // 1 placement + 50 payment flip-flops
    rt.block_on(async {
        let placed = OrderEvent::order_placed(
            agg_id,
            TenantId::new("bench"),
            CustomerId::new(),
            VendorId::new(),
            vec![OrderItem::new("SKU-1", "Meal", 1, Money::from_cents(100))],
            "USD",
        )
        .unwrap();
        let mut events = vec![make_envelope(agg_id, 1, &placed)];
        for v in 2..=51 {
            let status = if v % 2 == 0 {
                PaymentStatus::Pending
            } else {
                PaymentStatus::Failed
            };
            let recorded = OrderEvent::payment_recorded(status, Some(format!("PAY-{v}")));
            events.push(make_envelope(agg_id, v, &recorded));
        }
        store.append(events, AppendOptions::new()).await.unwrap();
    });

    c.bench_function("domain/reconstruct_51_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events = store.get_events_for_aggregate(agg_id).await.unwrap();
                let mut order = Order::default();
                for event in &events {
                    let domain_event: OrderEvent =
                        serde_json::from_value(event.payload.clone()).unwrap();
                    order.apply(domain_event);
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_transition_table,
    bench_place_order,
    bench_delivery_path,
    bench_aggregate_reconstruction,
);
criterion_main!(benches);
