mod common;

use chrono::{Duration as ChronoDuration, Utc};
use event_bus::MessageEnvelope;
use event_relay_rs::metrics::Metrics;
use event_relay_rs::models::NewOutboxEvent;
use event_relay_rs::repos::{InMemoryStore, InboxStore, OutboxStore, StoreError};
use event_relay_rs::{CleanupConfig, CleanupJob, CleanupReport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn job(store: &InMemoryStore, config: CleanupConfig) -> CleanupJob {
    CleanupJob::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        config,
        Metrics::new().unwrap(),
    )
}

async fn processed_outbox_rows(store: &InMemoryStore, count: usize) {
    for i in 0..count {
        let row = store
            .enqueue(NewOutboxEvent::new(
                "UserCreated",
                json!({ "n": i }),
                Uuid::new_v4(),
            ))
            .await
            .unwrap();
        OutboxStore::mark_processed(store, row.id).await.unwrap();
    }
}

#[tokio::test]
async fn test_unprocessed_rows_survive_any_age() {
    let store = InMemoryStore::new();
    let pending = store
        .enqueue(NewOutboxEvent::new("UserCreated", json!({}), Uuid::new_v4()))
        .await
        .unwrap();
    let poisoned = store
        .enqueue(NewOutboxEvent::new("UserUpdated", json!({}), Uuid::new_v4()))
        .await
        .unwrap();
    store.mark_poisoned(poisoned.id, "broker down").await.unwrap();

    let envelope = MessageEnvelope::new("UserCreated", json!({}), Uuid::new_v4())
        .with_message_id("m-unprocessed");
    store.begin(&envelope, Duration::from_secs(300)).await.unwrap();

    let far_future = Utc::now() + ChronoDuration::days(3650);
    let report = job(&store, CleanupConfig::default())
        .run_once_at(far_future)
        .await
        .unwrap();

    assert_eq!(report, CleanupReport::default());
    assert!(OutboxStore::get(&store, pending.id).await.unwrap().is_some());
    assert!(OutboxStore::get(&store, poisoned.id).await.unwrap().is_some());
    assert!(InboxStore::get(&store, "m-unprocessed").await.unwrap().is_some());
}

#[tokio::test]
async fn test_processed_rows_within_retention_are_kept() {
    let store = InMemoryStore::new();
    processed_outbox_rows(&store, 3).await;

    let report = job(&store, CleanupConfig::default())
        .run_once_at(Utc::now() + ChronoDuration::days(29))
        .await
        .unwrap();

    assert_eq!(report.outbox_deleted, 0);
    assert_eq!(store.outbox_rows().len(), 3);
}

#[tokio::test]
async fn test_expired_rows_are_deleted_in_batches() {
    let store = InMemoryStore::new();
    processed_outbox_rows(&store, 7).await;

    let envelope = MessageEnvelope::new("UserCreated", json!({}), Uuid::new_v4())
        .with_message_id("m-done");
    store.begin(&envelope, Duration::from_secs(300)).await.unwrap();
    InboxStore::mark_processed(&store, "m-done").await.unwrap();

    let config = CleanupConfig {
        batch_size: 3,
        ..CleanupConfig::default()
    };
    let report = job(&store, config)
        .run_once_at(Utc::now() + ChronoDuration::days(31))
        .await
        .unwrap();

    assert_eq!(
        report,
        CleanupReport {
            outbox_deleted: 7,
            inbox_deleted: 1
        }
    );
    assert!(store.outbox_rows().is_empty());
    assert!(store.inbox_rows().is_empty());
}

#[tokio::test]
async fn test_per_table_switches_and_windows() {
    let store = InMemoryStore::new();
    processed_outbox_rows(&store, 2).await;

    let envelope = MessageEnvelope::new("UserCreated", json!({}), Uuid::new_v4())
        .with_message_id("m-kept");
    store.begin(&envelope, Duration::from_secs(300)).await.unwrap();
    InboxStore::mark_processed(&store, "m-kept").await.unwrap();

    let config = CleanupConfig {
        outbox_enabled: false,
        inbox_retention_days: 7,
        ..CleanupConfig::default()
    };
    let report = job(&store, config)
        .run_once_at(Utc::now() + ChronoDuration::days(8))
        .await
        .unwrap();

    assert_eq!(report.outbox_deleted, 0);
    assert_eq!(report.inbox_deleted, 1);
    assert_eq!(store.outbox_rows().len(), 2);
}

#[tokio::test]
async fn test_out_of_range_retention_is_an_error() {
    let store = InMemoryStore::new();
    processed_outbox_rows(&store, 1).await;

    let config = CleanupConfig {
        outbox_retention_days: i64::MAX / 86_400,
        ..Default::default()
    };
    let result = job(&store, config).run_once().await;

    assert!(matches!(result, Err(StoreError::Invalid(_))));
    assert_eq!(store.outbox_rows().len(), 1);
}
