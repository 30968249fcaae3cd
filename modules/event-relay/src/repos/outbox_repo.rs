//! Outbox repository for reliable event publishing
//!
//! Business code calls [`enqueue_in_tx`] inside its own transaction so the
//! event row commits or rolls back together with the domain change. Everything
//! else on [`PgOutboxStore`] belongs to the dispatcher and the cleanup job.

use super::{OutboxStore, StoreError, StoreResult};
use crate::models::{NewOutboxEvent, OutboxBacklog, OutboxEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

const OUTBOX_COLUMNS: &str = "id, event_type, event_data, organization_id, created_at, \
     processed_at, retry_count, last_error, last_error_at, poisoned_at, claimed_by, claimed_at";

/// Insert an event into the outbox within the caller's transaction
///
/// `created_at` uses the wall clock rather than the transaction start so
/// several events written by one transaction keep their insertion order.
pub async fn enqueue_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> StoreResult<OutboxEvent> {
    event.validate().map_err(StoreError::Invalid)?;

    let row = sqlx::query_as::<_, OutboxEvent>(&format!(
        r#"
        INSERT INTO outbox_events (id, event_type, event_data, organization_id, created_at)
        VALUES ($1, $2, $3, $4, clock_timestamp())
        RETURNING {OUTBOX_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(&event.event_type)
    .bind(&event.event_data)
    .bind(event.organization_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row)
}

#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        let mut tx = self.pool.begin().await?;
        let row = enqueue_in_tx(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<OutboxEvent>> {
        // SKIP LOCKED keeps concurrent dispatchers off each other's rows; the
        // lease columns cover the window after this statement commits.
        let mut rows = sqlx::query_as::<_, OutboxEvent>(&format!(
            r#"
            UPDATE outbox_events
            SET claimed_by = $1, claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE processed_at IS NULL
                  AND poisoned_at IS NULL
                  AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $3))
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn renew_claims(
        &self,
        worker_id: &str,
        ids: &[Uuid],
        lease: Duration,
    ) -> StoreResult<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let renewed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET claimed_at = NOW()
            WHERE id = ANY($1)
              AND claimed_by = $2
              AND processed_at IS NULL
              AND poisoned_at IS NULL
              AND claimed_at >= NOW() - make_interval(secs => $3)
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(renewed)
    }

    async fn mark_processed(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NOW(), claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> StoreResult<i32> {
        let retry_count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1, last_error = $3, last_error_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND processed_at IS NULL
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        retry_count.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn mark_poisoned(&self, id: Uuid, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET poisoned_at = NOW(), last_error = $2, last_error_at = NOW(),
                claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_claim(&self, id: Uuid, worker_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<OutboxEvent>> {
        let row = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_poisoned(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let rows = sqlx::query_as::<_, OutboxEvent>(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS} FROM outbox_events
            WHERE poisoned_at IS NOT NULL AND processed_at IS NULL
            ORDER BY poisoned_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn requeue_poisoned(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET poisoned_at = NULL, retry_count = 0, claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND poisoned_at IS NOT NULL AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn backlog(&self) -> StoreResult<OutboxBacklog> {
        let (pending, poisoned): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_at IS NULL AND poisoned_at IS NULL),
                COUNT(*) FILTER (WHERE processed_at IS NULL AND poisoned_at IS NOT NULL)
            FROM outbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxBacklog { pending, poisoned })
    }

    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE processed_at IS NOT NULL AND processed_at < $1
                ORDER BY processed_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
