//! In-memory stores for tests
//!
//! Mirrors the Postgres repositories row for row, including lease expiry and
//! the unique message id of the inbox. Nothing survives a restart.

use super::{DeadLetterStore, InboxStore, OutboxStore, StoreError, StoreResult};
use crate::models::{
    BeginOutcome, FailedEvent, InboxBacklog, InboxEvent, NewFailedEvent, NewOutboxEvent,
    OutboxBacklog, OutboxEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::MessageEnvelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    outbox: Vec<OutboxEvent>,
    inbox: HashMap<String, InboxEvent>,
    failed: Vec<FailedEvent>,
}

/// All three tables behind one lock
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the outbox in insertion order
    pub fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.lock().outbox.clone()
    }

    pub fn inbox_rows(&self) -> Vec<InboxEvent> {
        let mut rows: Vec<InboxEvent> = self.lock().inbox.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }
}

fn lease_expired(claimed_at: Option<DateTime<Utc>>, lease: Duration, now: DateTime<Utc>) -> bool {
    match claimed_at {
        None => true,
        Some(at) => {
            let lease = chrono::Duration::from_std(lease)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
            at + lease <= now
        }
    }
}

fn clamp_limit(limit: i64) -> usize {
    usize::try_from(limit.max(0)).unwrap_or(usize::MAX)
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        event.validate().map_err(StoreError::Invalid)?;

        let row = OutboxEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            event_data: event.event_data,
            organization_id: event.organization_id,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
            last_error_at: None,
            poisoned_at: None,
            claimed_by: None,
            claimed_at: None,
        };
        self.lock().outbox.push(row.clone());
        Ok(row)
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<OutboxEvent>> {
        let now = Utc::now();
        let mut tables = self.lock();

        let mut eligible: Vec<usize> = tables
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.processed_at.is_none()
                    && row.poisoned_at.is_none()
                    && lease_expired(row.claimed_at, lease, now)
            })
            .map(|(idx, _)| idx)
            .collect();
        // Stable: rows sharing a timestamp keep insertion order
        eligible.sort_by_key(|idx| tables.outbox[*idx].created_at);
        eligible.truncate(clamp_limit(limit));

        let mut claimed = Vec::with_capacity(eligible.len());
        for idx in eligible {
            let row = &mut tables.outbox[idx];
            row.claimed_by = Some(worker_id.to_string());
            row.claimed_at = Some(now);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn renew_claims(
        &self,
        worker_id: &str,
        ids: &[Uuid],
        lease: Duration,
    ) -> StoreResult<Vec<Uuid>> {
        let now = Utc::now();
        let mut tables = self.lock();

        let mut renewed = Vec::with_capacity(ids.len());
        for row in tables.outbox.iter_mut().filter(|row| {
            ids.contains(&row.id)
                && row.claimed_by.as_deref() == Some(worker_id)
                && row.processed_at.is_none()
                && row.poisoned_at.is_none()
                && !lease_expired(row.claimed_at, lease, now)
        }) {
            row.claimed_at = Some(now);
            renewed.push(row.id);
        }
        Ok(renewed)
    }

    async fn mark_processed(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.lock();
        match tables
            .outbox
            .iter_mut()
            .find(|row| row.id == id && row.processed_at.is_none())
        {
            Some(row) => {
                row.processed_at = Some(Utc::now());
                row.claimed_by = None;
                row.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> StoreResult<i32> {
        let mut tables = self.lock();
        let row = tables
            .outbox
            .iter_mut()
            .find(|row| {
                row.id == id
                    && row.claimed_by.as_deref() == Some(worker_id)
                    && row.processed_at.is_none()
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.retry_count += 1;
        row.last_error = Some(error.to_string());
        row.last_error_at = Some(Utc::now());
        Ok(row.retry_count)
    }

    async fn mark_poisoned(&self, id: Uuid, error: &str) -> StoreResult<()> {
        let mut tables = self.lock();
        if let Some(row) = tables
            .outbox
            .iter_mut()
            .find(|row| row.id == id && row.processed_at.is_none())
        {
            let now = Utc::now();
            row.poisoned_at = Some(now);
            row.last_error = Some(error.to_string());
            row.last_error_at = Some(now);
            row.claimed_by = None;
            row.claimed_at = None;
        }
        Ok(())
    }

    async fn release_claim(&self, id: Uuid, worker_id: &str) -> StoreResult<()> {
        let mut tables = self.lock();
        if let Some(row) = tables
            .outbox
            .iter_mut()
            .find(|row| row.id == id && row.claimed_by.as_deref() == Some(worker_id))
        {
            row.claimed_by = None;
            row.claimed_at = None;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<OutboxEvent>> {
        Ok(self.lock().outbox.iter().find(|row| row.id == id).cloned())
    }

    async fn list_poisoned(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let mut rows: Vec<OutboxEvent> = self
            .lock()
            .outbox
            .iter()
            .filter(|row| row.poisoned_at.is_some() && row.processed_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.poisoned_at.cmp(&b.poisoned_at));
        rows.truncate(clamp_limit(limit));
        Ok(rows)
    }

    async fn requeue_poisoned(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.lock();
        match tables.outbox.iter_mut().find(|row| {
            row.id == id && row.poisoned_at.is_some() && row.processed_at.is_none()
        }) {
            Some(row) => {
                row.poisoned_at = None;
                row.retry_count = 0;
                row.claimed_by = None;
                row.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn backlog(&self) -> StoreResult<OutboxBacklog> {
        let tables = self.lock();
        let mut backlog = OutboxBacklog::default();
        for row in tables.outbox.iter().filter(|row| row.processed_at.is_none()) {
            if row.poisoned_at.is_some() {
                backlog.poisoned += 1;
            } else {
                backlog.pending += 1;
            }
        }
        Ok(backlog)
    }

    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let mut tables = self.lock();
        let mut doomed: Vec<(DateTime<Utc>, Uuid)> = tables
            .outbox
            .iter()
            .filter_map(|row| match row.processed_at {
                Some(at) if at < cutoff => Some((at, row.id)),
                _ => None,
            })
            .collect();
        doomed.sort();
        doomed.truncate(clamp_limit(limit));

        tables
            .outbox
            .retain(|row| !doomed.iter().any(|(_, id)| *id == row.id));
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl InboxStore for InMemoryStore {
    async fn begin(
        &self,
        envelope: &MessageEnvelope,
        lease: Duration,
    ) -> StoreResult<BeginOutcome> {
        let now = Utc::now();
        let mut tables = self.lock();

        if !tables.inbox.contains_key(&envelope.message_id) {
            tables.inbox.insert(
                envelope.message_id.clone(),
                InboxEvent::from_envelope(envelope, now),
            );
            return Ok(BeginOutcome::Started { attempts: 1 });
        }
        let Some(row) = tables.inbox.get_mut(&envelope.message_id) else {
            return Ok(BeginOutcome::InFlight);
        };

        if row.processed_at.is_some() {
            return Ok(BeginOutcome::AlreadyProcessed);
        }
        if row.dead_lettered_at.is_some() {
            return Ok(BeginOutcome::DeadLettered);
        }
        if !lease_expired(row.claimed_at, lease, now) {
            return Ok(BeginOutcome::InFlight);
        }

        row.attempts += 1;
        row.claimed_at = Some(now);
        Ok(BeginOutcome::Started {
            attempts: row.attempts,
        })
    }

    async fn mark_processed(&self, message_id: &str) -> StoreResult<bool> {
        let mut tables = self.lock();
        match tables.inbox.get_mut(message_id) {
            Some(row) if row.processed_at.is_none() => {
                row.processed_at = Some(Utc::now());
                row.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, message_id: &str, error: &str) -> StoreResult<()> {
        let mut tables = self.lock();
        if let Some(row) = tables.inbox.get_mut(message_id) {
            if row.processed_at.is_none() {
                row.last_error = Some(error.to_string());
                row.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn mark_dead_lettered(&self, message_id: &str, error: &str) -> StoreResult<()> {
        let mut tables = self.lock();
        if let Some(row) = tables.inbox.get_mut(message_id) {
            if row.processed_at.is_none() {
                row.dead_lettered_at = Some(Utc::now());
                row.last_error = Some(error.to_string());
                row.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn get(&self, message_id: &str) -> StoreResult<Option<InboxEvent>> {
        Ok(self.lock().inbox.get(message_id).cloned())
    }

    async fn backlog(&self) -> StoreResult<InboxBacklog> {
        let tables = self.lock();
        let mut backlog = InboxBacklog::default();
        for row in tables.inbox.values().filter(|row| row.processed_at.is_none()) {
            if row.dead_lettered_at.is_some() {
                backlog.dead_lettered += 1;
            } else {
                backlog.unprocessed += 1;
            }
        }
        Ok(backlog)
    }

    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let mut tables = self.lock();
        let mut doomed: Vec<(DateTime<Utc>, String)> = tables
            .inbox
            .values()
            .filter_map(|row| match row.processed_at {
                Some(at) if at < cutoff => Some((at, row.message_id.clone())),
                _ => None,
            })
            .collect();
        doomed.sort();
        doomed.truncate(clamp_limit(limit));

        for (_, message_id) in &doomed {
            tables.inbox.remove(message_id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn record(&self, event: NewFailedEvent) -> StoreResult<FailedEvent> {
        let row = FailedEvent {
            id: Uuid::new_v4(),
            message_id: event.message_id,
            subject: event.subject,
            organization_id: event.organization_id,
            envelope: event.envelope,
            error: event.error,
            attempts: event.attempts,
            failed_at: Utc::now(),
        };
        self.lock().failed.push(row.clone());
        Ok(row)
    }

    async fn list(&self, limit: i64) -> StoreResult<Vec<FailedEvent>> {
        let tables = self.lock();
        Ok(tables
            .failed
            .iter()
            .rev()
            .take(clamp_limit(limit))
            .cloned()
            .collect())
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.lock().failed.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_event(event_type: &str) -> NewOutboxEvent {
        NewOutboxEvent::new(event_type, json!({"k": "v"}), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_claim_skips_rows_under_live_lease() {
        let store = InMemoryStore::new();
        store.enqueue(new_event("UserCreated")).await.unwrap();
        store.enqueue(new_event("UserUpdated")).await.unwrap();

        let lease = Duration::from_secs(60);
        let first = store.claim_batch("worker-a", 10, lease).await.unwrap();
        let second = store.claim_batch("worker-b", 10, lease).await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(first[0].event_type, "UserCreated");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = InMemoryStore::new();
        store.enqueue(new_event("UserCreated")).await.unwrap();

        store.claim_batch("worker-a", 10, Duration::ZERO).await.unwrap();
        let reclaimed = store
            .claim_batch("worker-b", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn test_release_claim_only_by_owner() {
        let store = InMemoryStore::new();
        let row = store.enqueue(new_event("UserCreated")).await.unwrap();
        store
            .claim_batch("worker-a", 10, Duration::from_secs(60))
            .await
            .unwrap();

        store.release_claim(row.id, "worker-b").await.unwrap();
        let still_claimed = OutboxStore::get(&store, row.id).await.unwrap().unwrap();
        assert_eq!(still_claimed.claimed_by.as_deref(), Some("worker-a"));

        store.release_claim(row.id, "worker-a").await.unwrap();
        let released = OutboxStore::get(&store, row.id).await.unwrap().unwrap();
        assert!(released.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_renew_keeps_only_live_claims_of_the_owner() {
        let store = InMemoryStore::new();
        let kept = store.enqueue(new_event("UserCreated")).await.unwrap();
        let stolen = store.enqueue(new_event("UserUpdated")).await.unwrap();
        let lease = Duration::from_secs(60);
        store.claim_batch("worker-a", 10, lease).await.unwrap();

        // Another worker took the second row after the first lease lapsed
        store.release_claim(stolen.id, "worker-a").await.unwrap();
        store.claim_batch("worker-b", 10, lease).await.unwrap();

        let renewed = store
            .renew_claims("worker-a", &[kept.id, stolen.id], lease)
            .await
            .unwrap();
        assert_eq!(renewed, vec![kept.id]);

        let lapsed = store
            .renew_claims("worker-a", &[kept.id], Duration::ZERO)
            .await
            .unwrap();
        assert!(lapsed.is_empty());
    }

    #[tokio::test]
    async fn test_record_failure_requires_the_claim() {
        let store = InMemoryStore::new();
        let row = store.enqueue(new_event("UserCreated")).await.unwrap();
        store
            .claim_batch("worker-a", 10, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            store.record_failure(row.id, "worker-b", "timeout").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(
            store.record_failure(row.id, "worker-a", "timeout").await.unwrap(),
            1
        );
        let stored = OutboxStore::get(&store, row.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_event() {
        let store = InMemoryStore::new();
        let result = store
            .enqueue(NewOutboxEvent::new("", json!({}), Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_inbox_begin_outcomes() {
        let store = InMemoryStore::new();
        let envelope = MessageEnvelope::new("UserCreated", json!({}), Uuid::new_v4())
            .with_message_id("m-1");
        let lease = Duration::from_secs(300);

        assert_eq!(
            store.begin(&envelope, lease).await.unwrap(),
            BeginOutcome::Started { attempts: 1 }
        );
        assert_eq!(
            store.begin(&envelope, lease).await.unwrap(),
            BeginOutcome::InFlight
        );

        store.mark_failed("m-1", "boom").await.unwrap();
        assert_eq!(
            store.begin(&envelope, lease).await.unwrap(),
            BeginOutcome::Started { attempts: 2 }
        );

        assert!(InboxStore::mark_processed(&store, "m-1").await.unwrap());
        assert_eq!(
            store.begin(&envelope, lease).await.unwrap(),
            BeginOutcome::AlreadyProcessed
        );
        assert_eq!(store.inbox_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_lettered_message_is_not_restarted() {
        let store = InMemoryStore::new();
        let envelope = MessageEnvelope::new("UserCreated", json!({}), Uuid::new_v4())
            .with_message_id("m-2");
        let lease = Duration::from_secs(300);

        store.begin(&envelope, lease).await.unwrap();
        store.mark_dead_lettered("m-2", "rejected").await.unwrap();

        assert_eq!(
            store.begin(&envelope, lease).await.unwrap(),
            BeginOutcome::DeadLettered
        );
        let backlog = InboxStore::backlog(&store).await.unwrap();
        assert_eq!(backlog.dead_lettered, 1);
        assert_eq!(backlog.unprocessed, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_list_is_newest_first() {
        let store = InMemoryStore::new();
        for subject in ["a", "b", "c"] {
            store
                .record(NewFailedEvent {
                    message_id: None,
                    subject: subject.to_string(),
                    organization_id: None,
                    envelope: "{}".to_string(),
                    error: "bad".to_string(),
                    attempts: 1,
                })
                .await
                .unwrap();
        }

        let listed = store.list(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].subject, "c");
        assert_eq!(store.count().await.unwrap(), 3);
    }
}
