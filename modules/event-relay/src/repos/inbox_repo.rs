//! Inbox repository: idempotent recording of inbound messages

use super::{InboxStore, StoreResult};
use crate::models::{BeginOutcome, InboxBacklog, InboxEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::MessageEnvelope;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

const INBOX_COLUMNS: &str = "id, message_id, event_type, event_data, organization_id, \
     created_at, processed_at, attempts, last_error, claimed_at, dead_lettered_at";

#[derive(Debug, Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn begin(
        &self,
        envelope: &MessageEnvelope,
        lease: Duration,
    ) -> StoreResult<BeginOutcome> {
        let inserted: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO inbox_events
                (id, message_id, event_type, event_data, organization_id, created_at, attempts, claimed_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), 1, NOW())
            ON CONFLICT (message_id) DO NOTHING
            RETURNING attempts
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&envelope.message_id)
        .bind(&envelope.event_type)
        .bind(&envelope.event_data)
        .bind(envelope.organization_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempts) = inserted {
            return Ok(BeginOutcome::Started { attempts });
        }

        // Duplicate: take the row over only if nobody finished it and nobody
        // holds a live claim on it.
        let reclaimed: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE inbox_events
            SET attempts = attempts + 1, claimed_at = NOW()
            WHERE message_id = $1
              AND processed_at IS NULL
              AND dead_lettered_at IS NULL
              AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $2))
            RETURNING attempts
            "#,
        )
        .bind(&envelope.message_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempts) = reclaimed {
            return Ok(BeginOutcome::Started { attempts });
        }

        let state: Option<(bool, bool)> = sqlx::query_as(
            r#"
            SELECT processed_at IS NOT NULL, dead_lettered_at IS NOT NULL
            FROM inbox_events
            WHERE message_id = $1
            "#,
        )
        .bind(&envelope.message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match state {
            Some((true, _)) => BeginOutcome::AlreadyProcessed,
            Some((false, true)) => BeginOutcome::DeadLettered,
            _ => BeginOutcome::InFlight,
        })
    }

    async fn mark_processed(&self, message_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbox_events
            SET processed_at = NOW(), claimed_at = NULL
            WHERE message_id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, message_id: &str, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE inbox_events
            SET last_error = $2, claimed_at = NULL
            WHERE message_id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(message_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_dead_lettered(&self, message_id: &str, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE inbox_events
            SET dead_lettered_at = NOW(), last_error = $2, claimed_at = NULL
            WHERE message_id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(message_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, message_id: &str) -> StoreResult<Option<InboxEvent>> {
        let row = sqlx::query_as::<_, InboxEvent>(&format!(
            "SELECT {INBOX_COLUMNS} FROM inbox_events WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn backlog(&self) -> StoreResult<InboxBacklog> {
        let (unprocessed, dead_lettered): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_at IS NULL AND dead_lettered_at IS NULL),
                COUNT(*) FILTER (WHERE processed_at IS NULL AND dead_lettered_at IS NOT NULL)
            FROM inbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(InboxBacklog {
            unprocessed,
            dead_lettered,
        })
    }

    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox_events
            WHERE id IN (
                SELECT id FROM inbox_events
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
