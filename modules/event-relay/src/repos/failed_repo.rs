use super::{DeadLetterStore, StoreResult};
use crate::models::{FailedEvent, NewFailedEvent};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

const FAILED_COLUMNS: &str =
    "id, message_id, subject, organization_id, envelope, error, attempts, failed_at";

/// Dead-letter record backed by `failed_events`
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn record(&self, event: NewFailedEvent) -> StoreResult<FailedEvent> {
        let row = sqlx::query_as::<_, FailedEvent>(&format!(
            r#"
            INSERT INTO failed_events (id, message_id, subject, organization_id, envelope, error, attempts, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING {FAILED_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&event.message_id)
        .bind(&event.subject)
        .bind(event.organization_id)
        .bind(&event.envelope)
        .bind(&event.error)
        .bind(event.attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list(&self, limit: i64) -> StoreResult<Vec<FailedEvent>> {
        let rows = sqlx::query_as::<_, FailedEvent>(&format!(
            "SELECT {FAILED_COLUMNS} FROM failed_events ORDER BY failed_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
