//! Outbox dispatcher
//!
//! Polls `outbox_events` for unprocessed rows and publishes them to the event
//! bus. Each tick claims a batch under a lease so several dispatcher
//! instances can run side by side without publishing the same row twice.
//! The lease is renewed before every row and every publish attempt; a row
//! whose lease lapsed or moved to another worker is skipped untouched.

use crate::metrics::Metrics;
use crate::models::OutboxEvent;
use crate::repos::{OutboxStore, StoreError, StoreResult};
use crate::routing::QueueRouter;
use event_bus::{retry_with_backoff, BusError, EventBus, RetryConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lease owner written to `claimed_by`
    pub worker_id: String,
    pub batch_size: i64,
    pub poll_interval: Duration,
    /// Failed publish attempts after which a row is poisoned
    pub max_retry_count: i32,
    pub claim_lease: Duration,
    /// In-tick retry schedule
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: "event-relay".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(10),
            max_retry_count: 3,
            claim_lease: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// Summary of one dispatch tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub published: usize,
    /// Rows left for a later tick
    pub failed: usize,
    pub poisoned: usize,
    /// Rows whose claim was lost before they were published
    pub skipped: usize,
}

enum RowOutcome {
    Published,
    Failed,
    Poisoned,
    Skipped,
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    router: QueueRouter,
    config: DispatcherConfig,
    metrics: Metrics,
    /// Failed attempts the store could not record, per row
    unrecorded_failures: Mutex<HashMap<Uuid, i32>>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        router: QueueRouter,
        config: DispatcherConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            bus,
            router,
            config,
            metrics,
            unrecorded_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim one batch and publish it in `created_at` order
    ///
    /// Only the claim itself can fail the tick; errors on individual rows
    /// are logged and counted as `failed`.
    pub async fn run_once(&self) -> StoreResult<DispatchReport> {
        let batch = self
            .store
            .claim_batch(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.claim_lease,
            )
            .await?;

        let mut report = DispatchReport {
            claimed: batch.len(),
            ..Default::default()
        };

        let mut held: Vec<_> = batch.iter().map(|event| event.id).collect();

        for event in &batch {
            held = self.renew(&held).await;
            if !held.contains(&event.id) {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    worker_id = %self.config.worker_id,
                    "Outbox claim lost before publish, skipping row"
                );
                report.skipped += 1;
                continue;
            }

            match self.dispatch_one(event).await {
                Ok(RowOutcome::Published) => report.published += 1,
                Ok(RowOutcome::Failed) => report.failed += 1,
                Ok(RowOutcome::Poisoned) => report.poisoned += 1,
                Ok(RowOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Outbox bookkeeping failed; row stays claimed until its lease expires"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Ids of `ids` whose lease this worker still holds, freshly extended
    ///
    /// A store error counts as losing every claim: nothing is published
    /// without a confirmed lease.
    async fn renew(&self, ids: &[Uuid]) -> Vec<Uuid> {
        match self
            .store
            .renew_claims(&self.config.worker_id, ids, self.config.claim_lease)
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                tracing::error!(error = %e, "Failed to renew outbox claims");
                Vec::new()
            }
        }
    }

    fn carried_failures(&self, id: Uuid) -> i32 {
        self.unrecorded_failures
            .lock()
            .map(|map| map.get(&id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn carry_failures(&self, id: Uuid, count: i32) {
        if let Ok(mut map) = self.unrecorded_failures.lock() {
            if count > 0 {
                map.insert(id, count);
            } else {
                map.remove(&id);
            }
        }
    }

    async fn dispatch_one(&self, event: &OutboxEvent) -> StoreResult<RowOutcome> {
        let max_retry_count = self.config.max_retry_count;
        let carried = self.carried_failures(event.id);
        let start_count = event.retry_count + carried;
        let remaining = max_retry_count - start_count;
        if remaining <= 0 {
            // Budget spent by an earlier run that stopped before poisoning
            let error = event
                .last_error
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_string());
            self.poison(event, start_count, &error).await?;
            return Ok(RowOutcome::Poisoned);
        }

        let queue = self.router.route(&event.event_type);
        let payload = match event.to_envelope().encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.poison(event, event.retry_count, &e.to_string()).await?;
                return Ok(RowOutcome::Poisoned);
            }
        };

        let attempts = self
            .config
            .retry
            .max_attempts
            .min(u32::try_from(remaining).unwrap_or(u32::MAX));
        let retry = self.config.retry.with_max_attempts(attempts);

        let retry_count = AtomicI32::new(start_count);
        let unrecorded = AtomicI32::new(carried);
        let last_error = Mutex::new(None::<String>);
        let attempt = AtomicU32::new(0);
        let claim_lost = AtomicBool::new(false);

        let published = retry_with_backoff(
            || {
                let payload = payload.clone();
                let retry_count = &retry_count;
                let unrecorded = &unrecorded;
                let last_error = &last_error;
                let attempt = &attempt;
                let claim_lost = &claim_lost;
                async move {
                    if claim_lost.load(Ordering::SeqCst) {
                        return Err(BusError::InternalError("outbox claim lost".to_string()));
                    }
                    // The first attempt runs right after the per-row renewal
                    if attempt.fetch_add(1, Ordering::SeqCst) > 0
                        && !self.renew(&[event.id]).await.contains(&event.id)
                    {
                        claim_lost.store(true, Ordering::SeqCst);
                        return Err(BusError::InternalError("outbox claim lost".to_string()));
                    }

                    let result = self.bus.publish(queue, payload).await;
                    if let Err(e) = &result {
                        let message = e.to_string();
                        self.metrics
                            .outbox_publish_failures_total
                            .with_label_values(&[event.event_type.as_str()])
                            .inc();
                        match self
                            .store
                            .record_failure(event.id, &self.config.worker_id, &message)
                            .await
                        {
                            Ok(count) => {
                                let total = count + unrecorded.load(Ordering::SeqCst);
                                retry_count.store(total, Ordering::SeqCst);
                            }
                            Err(StoreError::NotFound(_)) => {
                                claim_lost.store(true, Ordering::SeqCst);
                            }
                            Err(store_err) => {
                                // Keep counting so the row still reaches the poison threshold
                                unrecorded.fetch_add(1, Ordering::SeqCst);
                                retry_count.fetch_add(1, Ordering::SeqCst);
                                tracing::warn!(
                                    event_id = %event.id,
                                    error = %store_err,
                                    "Failed to record publish failure"
                                );
                            }
                        }
                        if let Ok(mut slot) = last_error.lock() {
                            *slot = Some(message);
                        }
                    }
                    result
                }
            },
            &retry,
            "outbox_publish",
        )
        .await;

        if claim_lost.load(Ordering::SeqCst) && published.is_err() {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                worker_id = %self.config.worker_id,
                "Outbox claim lost during retries, leaving row to its new owner"
            );
            return Ok(RowOutcome::Skipped);
        }

        let unrecorded = unrecorded.load(Ordering::SeqCst);

        match published {
            Ok(()) => {
                self.carry_failures(event.id, 0);
                self.store.mark_processed(event.id).await?;
                self.metrics
                    .outbox_published_total
                    .with_label_values(&[queue])
                    .inc();
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    organization_id = %event.organization_id,
                    queue = %queue,
                    retry_count = retry_count.load(Ordering::SeqCst),
                    "Outbox event published"
                );
                Ok(RowOutcome::Published)
            }
            Err(e) => {
                let count = retry_count.load(Ordering::SeqCst);
                if count >= max_retry_count {
                    let error = last_error
                        .lock()
                        .ok()
                        .and_then(|slot| slot.clone())
                        .unwrap_or_else(|| e.to_string());
                    self.poison(event, count, &error).await?;
                    Ok(RowOutcome::Poisoned)
                } else {
                    self.carry_failures(event.id, unrecorded);
                    self.store
                        .release_claim(event.id, &self.config.worker_id)
                        .await?;
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = count,
                        max_retry_count,
                        error = %e,
                        "Outbox publish failed, will retry next tick"
                    );
                    Ok(RowOutcome::Failed)
                }
            }
        }
    }

    async fn poison(&self, event: &OutboxEvent, retry_count: i32, error: &str) -> StoreResult<()> {
        self.store.mark_poisoned(event.id, error).await?;
        self.carry_failures(event.id, 0);
        self.metrics
            .outbox_poisoned_total
            .with_label_values(&[event.event_type.as_str()])
            .inc();
        tracing::error!(
            event_id = %event.id,
            event_type = %event.event_type,
            organization_id = %event.organization_id,
            retry_count,
            error = %error,
            "Outbox event poisoned; requires operator attention"
        );
        Ok(())
    }

    /// Poll until cancelled
    ///
    /// A full, clean batch is followed immediately by the next one; otherwise
    /// the loop sleeps for the poll interval. Cancellation is observed
    /// between batches only.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting outbox dispatcher"
        );

        let mut tick_count: u64 = 0;

        while !cancel.is_cancelled() {
            tick_count += 1;

            let drained = match self.run_once().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        tracing::info!(
                            tick = tick_count,
                            claimed = report.claimed,
                            published = report.published,
                            failed = report.failed,
                            poisoned = report.poisoned,
                            skipped = report.skipped,
                            "Outbox dispatch tick"
                        );
                    } else if tick_count <= 3 || tick_count % 60 == 0 {
                        tracing::debug!(tick = tick_count, "No pending outbox events");
                    }
                    (report.claimed as i64) < self.config.batch_size || report.failed > 0
                }
                Err(e) => {
                    tracing::error!(tick = tick_count, error = %e, "Outbox dispatch tick failed");
                    true
                }
            };

            if drained {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Outbox dispatcher stopped");
    }
}
