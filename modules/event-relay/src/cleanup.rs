//! Retention cleanup for processed outbox and inbox rows
//!
//! Only rows with `processed_at` set and older than the retention window are
//! deleted. Unprocessed, poisoned and dead-lettered rows are kept forever so
//! operators can inspect them.

use crate::metrics::Metrics;
use crate::repos::{InboxStore, OutboxStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub outbox_retention_days: i64,
    pub inbox_retention_days: i64,
    pub outbox_enabled: bool,
    pub inbox_enabled: bool,
    /// Rows per DELETE statement
    pub batch_size: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
            outbox_retention_days: 30,
            inbox_retention_days: 30,
            outbox_enabled: true,
            inbox_enabled: true,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub outbox_deleted: u64,
    pub inbox_deleted: u64,
}

fn retention_cutoff(now: DateTime<Utc>, days: i64) -> StoreResult<DateTime<Utc>> {
    chrono::Duration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            StoreError::Invalid(format!("retention window of {days} days is out of range"))
        })
}

pub struct CleanupJob {
    outbox: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    config: CleanupConfig,
    metrics: Metrics,
}

impl CleanupJob {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        config: CleanupConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            outbox,
            inbox,
            config,
            metrics,
        }
    }

    pub async fn run_once(&self) -> StoreResult<CleanupReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Apply the retention windows as of `now`
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> StoreResult<CleanupReport> {
        let mut report = CleanupReport::default();

        if self.config.outbox_enabled {
            let cutoff = retention_cutoff(now, self.config.outbox_retention_days)?;
            let outbox = self.outbox.clone();
            report.outbox_deleted = self
                .delete_in_batches("outbox_events", |limit| {
                    let outbox = outbox.clone();
                    async move { outbox.delete_processed_before(cutoff, limit).await }
                })
                .await?;
        }

        if self.config.inbox_enabled {
            let cutoff = retention_cutoff(now, self.config.inbox_retention_days)?;
            let inbox = self.inbox.clone();
            report.inbox_deleted = self
                .delete_in_batches("inbox_events", |limit| {
                    let inbox = inbox.clone();
                    async move { inbox.delete_processed_before(cutoff, limit).await }
                })
                .await?;
        }

        Ok(report)
    }

    async fn delete_in_batches<F, Fut>(&self, table: &str, mut delete: F) -> StoreResult<u64>
    where
        F: FnMut(i64) -> Fut,
        Fut: std::future::Future<Output = StoreResult<u64>>,
    {
        let batch_size = self.config.batch_size.max(1);
        let mut total = 0u64;

        loop {
            let deleted = delete(batch_size).await?;
            total += deleted;
            if deleted > 0 {
                self.metrics
                    .cleanup_deleted_total
                    .with_label_values(&[table])
                    .inc_by(deleted);
            }
            if (deleted as i64) < batch_size {
                break;
            }
        }

        if total > 0 {
            tracing::info!(table = %table, deleted = total, "Retention cleanup removed rows");
        }
        Ok(total)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            outbox_retention_days = self.config.outbox_retention_days,
            inbox_retention_days = self.config.inbox_retention_days,
            "Starting retention cleanup"
        );

        loop {
            match self.run_once().await {
                Ok(report) => tracing::debug!(
                    outbox_deleted = report.outbox_deleted,
                    inbox_deleted = report.inbox_deleted,
                    "Retention cleanup finished"
                ),
                Err(e) => tracing::error!(error = %e, "Retention cleanup failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!("Retention cleanup stopped");
    }
}
