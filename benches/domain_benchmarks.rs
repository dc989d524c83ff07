use criterion::{Criterion, criterion_group, criterion_main};
use resilient_ledger::domain::{AmountRequest, DomainEvent, Transaction, TransactionKind};
use resilient_ledger::infra::{BreakerSettings, CircuitBreaker, EventBus, handler_fn};
use rust_decimal::Decimal;
use std::hint::black_box;
use uuid::Uuid;
use validator::Validate;

fn bench_validation(c: &mut Criterion) {
    let request = AmountRequest::new(Decimal::new(10_050, 2));

    c.bench_function("validate_amount_request", |b| {
        b.iter(|| {
            let _ = black_box(&request).validate();
        })
    });
}

fn bench_breaker_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let breaker = CircuitBreaker::new("bench", BreakerSettings::default());

    c.bench_function("breaker_execute_closed", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = breaker
                .execute(|| async { Ok::<_, std::io::Error>(black_box(1_u64)) })
                .await;
        })
    });
}

fn bench_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let bus = EventBus::default();
    for i in 0..4 {
        bus.subscribe(
            "deposit.completed",
            handler_fn(format!("noop-{i}"), |_event| async { anyhow::Ok(()) }),
        );
    }

    let mut tx = Transaction::new(Uuid::new_v4(), TransactionKind::Deposit, Decimal::ONE);
    tx.complete(tx.compute_reference_hash()).expect("pending");
    let event = DomainEvent::balance_completed(&tx).expect("completed");

    c.bench_function("publish_sync_four_handlers", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = bus.publish(black_box(&event)).await;
        })
    });
}

criterion_group!(benches, bench_validation, bench_breaker_execute, bench_publish);
criterion_main!(benches);
