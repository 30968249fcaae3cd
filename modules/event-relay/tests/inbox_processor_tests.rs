mod common;

use common::{eventually, next_delivery};
use event_bus::{AckKind, EventBus, InMemoryBus, MessageEnvelope, RetryConfig};
use event_relay_rs::handlers::default_registry;
use event_relay_rs::metrics::Metrics;
use event_relay_rs::models::BeginOutcome;
use event_relay_rs::repos::{DeadLetterStore, InMemoryStore, InboxStore};
use event_relay_rs::routing::USER_QUEUE;
use event_relay_rs::{
    HandlerError, HandlerRegistry, InboxConfig, InboxContext, InboxOutcome, InboxProcessor,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn inbox_config(max_delivery_attempts: i32) -> InboxConfig {
    InboxConfig {
        queues: vec![USER_QUEUE.to_string()],
        prefetch_count: 4,
        max_delivery_attempts,
        claim_lease: Duration::from_secs(300),
        redelivery: RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    }
}

fn processor_with(
    bus: &InMemoryBus,
    store: &InMemoryStore,
    registry: HandlerRegistry,
    config: InboxConfig,
) -> InboxProcessor {
    InboxProcessor::new(
        Arc::new(bus.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(registry),
        config,
        Metrics::new().unwrap(),
    )
}

fn processor(
    bus: &InMemoryBus,
    store: &InMemoryStore,
    registry: HandlerRegistry,
    max_delivery_attempts: i32,
) -> InboxProcessor {
    processor_with(bus, store, registry, inbox_config(max_delivery_attempts))
}

/// Registry whose `UserCreated` handler counts calls
fn counting_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("UserCreated", move |_ctx: InboxContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    registry
}

fn envelope(event_type: &str, message_id: &str) -> MessageEnvelope {
    MessageEnvelope::new(event_type, json!({"userId": "u-1"}), Uuid::new_v4())
        .with_message_id(message_id)
}

#[tokio::test]
async fn test_same_message_twice_runs_handler_once() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = processor(&bus, &store, counting_registry(calls.clone()), 5);

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    let payload = envelope("UserCreated", "m-1").encode().unwrap();
    bus.publish(USER_QUEUE, payload.clone()).await.unwrap();
    bus.publish(USER_QUEUE, payload).await.unwrap();

    let first = processor.handle_delivery(next_delivery(&mut deliveries).await).await;
    let second = processor.handle_delivery(next_delivery(&mut deliveries).await).await;

    assert_eq!(first, InboxOutcome::Processed);
    assert_eq!(second, InboxOutcome::Duplicate);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.settlement_count(AckKind::Ack), 2);

    let row = InboxStore::get(&store, "m-1").await.unwrap().unwrap();
    assert!(row.processed_at.is_some());
    assert_eq!(row.attempts, 1);
    assert_eq!(store.inbox_rows().len(), 1);
}

#[tokio::test]
async fn test_malformed_envelope_is_rejected_to_dead_letter() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = processor(&bus, &store, counting_registry(calls.clone()), 5);

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    let mut dead = bus.subscribe(bus.dead_letter_subject()).await.unwrap();
    bus.publish(USER_QUEUE, br#"{"eventType":"UserCreated"}"#.to_vec())
        .await
        .unwrap();

    let outcome = processor.handle_delivery(next_delivery(&mut deliveries).await).await;

    assert!(matches!(outcome, InboxOutcome::Malformed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(bus.settlement_count(AckKind::Reject), 1);
    assert!(store.inbox_rows().is_empty());

    let failed = store.list(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].subject, USER_QUEUE);
    assert!(failed[0].error.starts_with("malformed envelope"));

    let parked = next_delivery(&mut dead).await;
    assert_eq!(parked.message.payload, br#"{"eventType":"UserCreated"}"#.to_vec());
}

#[tokio::test]
async fn test_unroutable_event_is_acked_and_kept() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();
    let processor = processor(&bus, &store, default_registry().unwrap(), 5);

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    bus.publish(USER_QUEUE, envelope("UserDeleted", "m-2").encode().unwrap())
        .await
        .unwrap();

    let outcome = processor.handle_delivery(next_delivery(&mut deliveries).await).await;

    assert_eq!(outcome, InboxOutcome::Unroutable);
    assert_eq!(bus.settlement_count(AckKind::Ack), 1);

    let row = InboxStore::get(&store, "m-2").await.unwrap().unwrap();
    assert!(row.processed_at.is_none(), "unroutable rows stay visible for audit");
    assert!(row.last_error.unwrap().contains("no handler registered"));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_then_succeeds() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    let handler_calls = calls.clone();
    registry
        .register_fn("UserCreated", move |ctx: InboxContext| {
            let calls = handler_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(HandlerError::Transient("database busy".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .unwrap();
    let processor = processor(&bus, &store, registry, 5);

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    bus.publish(USER_QUEUE, envelope("UserCreated", "m-3").encode().unwrap())
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let delivery = next_delivery(&mut deliveries).await;
        outcomes.push(processor.handle_delivery(delivery).await);
    }

    assert_eq!(
        outcomes,
        vec![
            InboxOutcome::Retry { attempts: 1 },
            InboxOutcome::Retry { attempts: 2 },
            InboxOutcome::Processed,
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.settlement_count(AckKind::Nack), 2);
    assert_eq!(bus.settlement_count(AckKind::Ack), 1);

    // Redelivery follows the backoff schedule instead of coming back at once
    let delays: Vec<_> = bus
        .settlements()
        .into_iter()
        .filter(|s| s.kind == AckKind::Nack)
        .map(|s| s.redeliver_after)
        .collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_millis(1)),
            Some(Duration::from_millis(2))
        ]
    );

    let row = InboxStore::get(&store, "m-3").await.unwrap().unwrap();
    assert!(row.processed_at.is_some());
    assert_eq!(row.attempts, 3);
}

#[tokio::test]
async fn test_message_claimed_by_crashed_worker_is_handled_after_lease() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut config = inbox_config(5);
    config.claim_lease = Duration::from_millis(150);
    config.redelivery = RetryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(100),
    };
    let processor = processor_with(&bus, &store, counting_registry(calls.clone()), config);

    // A worker started the message and died before settling it
    let message = envelope("UserCreated", "m-crash");
    assert_eq!(
        store.begin(&message, Duration::from_millis(150)).await.unwrap(),
        BeginOutcome::Started { attempts: 1 }
    );

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    bus.publish(USER_QUEUE, message.encode().unwrap()).await.unwrap();

    let first = processor.handle_delivery(next_delivery(&mut deliveries).await).await;
    assert_eq!(first, InboxOutcome::InFlight);
    assert_eq!(bus.settlement_count(AckKind::Ack), 0);
    let settlements = bus.settlements();
    assert_eq!(settlements[0].kind, AckKind::Nack);
    assert_eq!(settlements[0].redeliver_after, Some(Duration::from_millis(50)));

    let mut outcome = first;
    for _ in 0..20 {
        if outcome == InboxOutcome::Processed {
            break;
        }
        outcome = processor.handle_delivery(next_delivery(&mut deliveries).await).await;
    }

    assert_eq!(outcome, InboxOutcome::Processed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.settlement_count(AckKind::Ack), 1);

    let row = InboxStore::get(&store, "m-crash").await.unwrap().unwrap();
    assert!(row.processed_at.is_some());
    assert_eq!(row.attempts, 2);
}

#[tokio::test]
async fn test_transient_failures_dead_letter_after_max_attempts() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();

    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("UserCreated", |_ctx: InboxContext| async {
            Err(HandlerError::Transient("downstream unavailable".to_string()))
        })
        .unwrap();
    let processor = processor(&bus, &store, registry, 2);

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    bus.publish(USER_QUEUE, envelope("UserCreated", "m-4").encode().unwrap())
        .await
        .unwrap();

    let first = processor.handle_delivery(next_delivery(&mut deliveries).await).await;
    let second = processor.handle_delivery(next_delivery(&mut deliveries).await).await;

    assert_eq!(first, InboxOutcome::Retry { attempts: 1 });
    assert!(matches!(second, InboxOutcome::DeadLettered { ref reason } if reason.contains("retries exhausted")));
    assert_eq!(bus.settlement_count(AckKind::Reject), 1);

    let row = InboxStore::get(&store, "m-4").await.unwrap().unwrap();
    assert!(row.dead_lettered_at.is_some());
    assert!(row.processed_at.is_none());

    let failed = store.list(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].message_id.as_deref(), Some("m-4"));
    assert_eq!(failed[0].attempts, 2);
}

#[tokio::test]
async fn test_rejected_event_is_dead_lettered_immediately() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();

    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("UserCreated", |_ctx: InboxContext| async {
            Err(HandlerError::Rejected("user belongs to another organization".to_string()))
        })
        .unwrap();
    let processor = processor(&bus, &store, registry, 5);

    let mut deliveries = bus.subscribe(USER_QUEUE).await.unwrap();
    let payload = envelope("UserCreated", "m-5").encode().unwrap();
    bus.publish(USER_QUEUE, payload.clone()).await.unwrap();

    let outcome = processor.handle_delivery(next_delivery(&mut deliveries).await).await;
    assert!(matches!(outcome, InboxOutcome::DeadLettered { .. }));

    // A later copy of the same message is not handled again
    bus.publish(USER_QUEUE, payload).await.unwrap();
    let again = processor.handle_delivery(next_delivery(&mut deliveries).await).await;
    assert_eq!(again, InboxOutcome::Duplicate);

    assert_eq!(store.count().await.unwrap(), 1);
    let backlog = InboxStore::backlog(&store).await.unwrap();
    assert_eq!(backlog.dead_lettered, 1);
}

#[tokio::test]
async fn test_run_consumes_until_cancelled() {
    let bus = InMemoryBus::new();
    let store = InMemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = Arc::new(processor(&bus, &store, counting_registry(calls.clone()), 5));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let processor = processor.clone();
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    assert!(eventually(|| bus.subscriber_count() >= 1).await);

    let payload = envelope("UserCreated", "m-6").encode().unwrap();
    bus.publish(USER_QUEUE, payload.clone()).await.unwrap();
    bus.publish(USER_QUEUE, payload).await.unwrap();

    assert!(eventually(|| bus.settlement_count(AckKind::Ack) == 2).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("processor did not stop after cancellation")
        .unwrap();
    assert!(result.is_ok());
}
