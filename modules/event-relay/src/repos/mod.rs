//! Persistence for the outbox, the inbox and the dead-letter record
//!
//! Each table sits behind a trait so the dispatcher and the processor can run
//! against Postgres in production and against [`memory::InMemoryStore`] in
//! tests and local development.

pub mod failed_repo;
pub mod inbox_repo;
pub mod memory;
pub mod outbox_repo;

pub use failed_repo::PgDeadLetterStore;
pub use inbox_repo::PgInboxStore;
pub use memory::InMemoryStore;
pub use outbox_repo::{enqueue_in_tx, PgOutboxStore};

use crate::models::{
    BeginOutcome, FailedEvent, InboxBacklog, InboxEvent, NewFailedEvent, NewOutboxEvent,
    OutboxBacklog, OutboxEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::MessageEnvelope;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("event not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a pending event outside of any caller transaction
    async fn enqueue(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent>;

    /// Lease up to `limit` pending rows to `worker_id`, oldest first
    ///
    /// Rows that are processed, poisoned or held by an unexpired lease are
    /// skipped. A lease older than `lease` is considered abandoned.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<OutboxEvent>>;

    /// Extend the lease on those of `ids` still held by `worker_id`
    ///
    /// Returns the ids that were renewed. A lease that already lapsed is not
    /// renewed, even when no other worker has claimed the row yet.
    async fn renew_claims(
        &self,
        worker_id: &str,
        ids: &[Uuid],
        lease: Duration,
    ) -> StoreResult<Vec<Uuid>>;

    /// Set `processed_at` and drop the lease; false if already processed
    async fn mark_processed(&self, id: Uuid) -> StoreResult<bool>;

    /// Count one failed publish attempt and return the new `retry_count`
    ///
    /// `NotFound` when the row is processed or no longer claimed by
    /// `worker_id`.
    async fn record_failure(&self, id: Uuid, worker_id: &str, error: &str)
        -> StoreResult<i32>;

    async fn mark_poisoned(&self, id: Uuid, error: &str) -> StoreResult<()>;

    /// Give the row back to the pool without touching its counters
    async fn release_claim(&self, id: Uuid, worker_id: &str) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<OutboxEvent>>;

    async fn list_poisoned(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>>;

    /// Operator action: clear the poison flag and reset the retry budget
    async fn requeue_poisoned(&self, id: Uuid) -> StoreResult<bool>;

    async fn backlog(&self) -> StoreResult<OutboxBacklog>;

    /// Delete at most `limit` rows processed before `cutoff`
    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Record the message (or re-claim an unfinished record) before handling
    ///
    /// The unique `message_id` makes this the idempotency guard: at most one
    /// delivery holds the claim at a time and a processed message is never
    /// started again.
    async fn begin(&self, envelope: &MessageEnvelope, lease: Duration)
        -> StoreResult<BeginOutcome>;

    /// Set `processed_at`; false if the row was already processed
    async fn mark_processed(&self, message_id: &str) -> StoreResult<bool>;

    /// Keep the row unprocessed, store the error and drop the claim
    async fn mark_failed(&self, message_id: &str, error: &str) -> StoreResult<()>;

    async fn mark_dead_lettered(&self, message_id: &str, error: &str) -> StoreResult<()>;

    async fn get(&self, message_id: &str) -> StoreResult<Option<InboxEvent>>;

    async fn backlog(&self) -> StoreResult<InboxBacklog>;

    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, event: NewFailedEvent) -> StoreResult<FailedEvent>;

    /// Most recent first
    async fn list(&self, limit: i64) -> StoreResult<Vec<FailedEvent>>;

    async fn count(&self) -> StoreResult<i64>;
}
