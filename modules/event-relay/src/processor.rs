//! Inbox processor
//!
//! Consumes the configured queues, records every message in `inbox_events`
//! before running its handler, and settles each delivery according to the
//! outcome:
//!
//! | outcome                         | inbox row                  | settlement |
//! |---------------------------------|----------------------------|------------|
//! | handler ok                      | `processed_at` set         | ack        |
//! | already processed               | untouched                  | ack        |
//! | in flight under a live claim    | untouched                  | delayed nack |
//! | no handler for the event type   | `last_error` set           | ack        |
//! | transient handler error         | `last_error` set           | delayed nack |
//! | rejected, or retries exhausted  | `dead_lettered_at` set     | reject     |
//! | malformed envelope              | none (`failed_events` only)| reject     |
//!
//! Nacks ask for redelivery after `redelivery.backoff_for(delivery_count)`.
//! An in-flight message is never acked: if the worker holding the claim has
//! died, a later redelivery finds the claim expired and runs the handler.

use crate::dlq::record_dead_letter;
use crate::handlers::{HandlerError, HandlerRegistry, InboxContext};
use crate::metrics::Metrics;
use crate::models::BeginOutcome;
use crate::repos::{DeadLetterStore, InboxStore};
use crate::routing;
use event_bus::{
    AckKind, BusMessage, BusResult, Delivery, EventBus, MessageEnvelope, RetryConfig,
};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub queues: Vec<String>,
    /// Deliveries handled concurrently
    pub prefetch_count: usize,
    /// Handler runs after which a transient failure is dead-lettered
    pub max_delivery_attempts: i32,
    /// How long a started message blocks concurrent redeliveries
    pub claim_lease: Duration,
    /// Redelivery delay schedule for nacked deliveries
    pub redelivery: RetryConfig,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                routing::USER_QUEUE.to_string(),
                routing::ORGANIZATION_QUEUE.to_string(),
                routing::FINANCIAL_QUEUE.to_string(),
            ],
            prefetch_count: 10,
            max_delivery_attempts: 5,
            claim_lease: Duration::from_secs(300),
            redelivery: RetryConfig {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
            },
        }
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    Processed,
    /// Processed (or dead-lettered) by an earlier delivery
    Duplicate,
    /// Another delivery holds a live claim; redelivery requested
    InFlight,
    /// No handler registered for the event type
    Unroutable,
    /// Transient handler failure; redelivery requested
    Retry { attempts: i32 },
    DeadLettered { reason: String },
    Malformed { reason: String },
    /// The inbox or dead-letter store failed; redelivery requested
    StoreFailure { error: String },
}

impl InboxOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            InboxOutcome::Processed => "processed",
            InboxOutcome::Duplicate => "duplicate",
            InboxOutcome::InFlight => "in_flight",
            InboxOutcome::Unroutable => "unroutable",
            InboxOutcome::Retry { .. } => "retry",
            InboxOutcome::DeadLettered { .. } => "dead_lettered",
            InboxOutcome::Malformed { .. } => "malformed",
            InboxOutcome::StoreFailure { .. } => "store_failure",
        }
    }

    pub fn ack_kind(&self) -> AckKind {
        match self {
            InboxOutcome::Processed | InboxOutcome::Duplicate | InboxOutcome::Unroutable => {
                AckKind::Ack
            }
            InboxOutcome::InFlight
            | InboxOutcome::Retry { .. }
            | InboxOutcome::StoreFailure { .. } => AckKind::Nack,
            InboxOutcome::DeadLettered { .. } | InboxOutcome::Malformed { .. } => {
                AckKind::Reject
            }
        }
    }
}

pub struct InboxProcessor {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn InboxStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    registry: Arc<HandlerRegistry>,
    config: InboxConfig,
    metrics: Metrics,
}

impl InboxProcessor {
    pub fn new(
        bus: Arc<dyn EventBus>,
        store: Arc<dyn InboxStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        registry: Arc<HandlerRegistry>,
        config: InboxConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            bus,
            store,
            dead_letters,
            registry,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &InboxConfig {
        &self.config
    }

    /// Process one delivery and settle it
    pub async fn handle_delivery(&self, delivery: Delivery) -> InboxOutcome {
        let delivery_count = i32::try_from(delivery.delivery_count).unwrap_or(i32::MAX);
        let outcome = self.process(&delivery.message, delivery_count).await;
        let kind = outcome.ack_kind();
        let subject = delivery.message.subject.clone();

        let settled = match kind {
            AckKind::Nack => {
                let delay = self.config.redelivery.backoff_for(delivery.delivery_count);
                delivery.nack_with_delay(delay).await
            }
            _ => delivery.settle(kind).await,
        };
        if let Err(e) = settled {
            // Unsettled deliveries come back after the broker's ack timeout
            tracing::warn!(
                subject = %subject,
                ack = %kind,
                error = %e,
                "Failed to settle delivery"
            );
        }

        self.metrics.inbox_outcome(outcome.label());
        outcome
    }

    async fn process(&self, msg: &BusMessage, delivery_count: i32) -> InboxOutcome {
        let envelope = match MessageEnvelope::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = format!("malformed envelope: {}", e);
                tracing::warn!(subject = %msg.subject, error = %e, "Rejecting malformed message");
                return if record_dead_letter(
                    self.dead_letters.as_ref(),
                    msg,
                    None,
                    &reason,
                    delivery_count,
                )
                .await
                {
                    InboxOutcome::Malformed { reason }
                } else {
                    InboxOutcome::StoreFailure { error: reason }
                };
            }
        };

        let span = tracing::info_span!(
            "inbox_message",
            message_id = %envelope.message_id,
            event_type = %envelope.event_type,
            organization_id = %envelope.organization_id,
            subject = %msg.subject,
        );

        self.process_envelope(msg, envelope).instrument(span).await
    }

    async fn process_envelope(&self, msg: &BusMessage, envelope: MessageEnvelope) -> InboxOutcome {
        let attempts = match self.store.begin(&envelope, self.config.claim_lease).await {
            Ok(BeginOutcome::Started { attempts }) => attempts,
            Ok(BeginOutcome::AlreadyProcessed) | Ok(BeginOutcome::DeadLettered) => {
                tracing::info!("Duplicate message ignored (already handled)");
                return InboxOutcome::Duplicate;
            }
            Ok(BeginOutcome::InFlight) => {
                tracing::info!("Message claimed by another delivery; requesting redelivery");
                return InboxOutcome::InFlight;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to record inbound message");
                return InboxOutcome::StoreFailure {
                    error: e.to_string(),
                };
            }
        };

        let Some(handler) = self.registry.get(&envelope.event_type) else {
            let error = format!(
                "no handler registered for event type {}",
                envelope.event_type
            );
            tracing::warn!("Unroutable message acknowledged; kept in inbox for audit");
            if let Err(e) = self.store.mark_failed(&envelope.message_id, &error).await {
                tracing::error!(error = %e, "Failed to record unroutable message");
            }
            return InboxOutcome::Unroutable;
        };

        let ctx = InboxContext {
            message_id: envelope.message_id.clone(),
            event_type: envelope.event_type.clone(),
            organization_id: envelope.organization_id,
            event_data: envelope.event_data.clone(),
            created_at: envelope.created_at,
            attempt: attempts,
        };

        let started = Instant::now();
        let result = handler.handle(&ctx).await;
        self.metrics
            .inbox_handler_duration_seconds
            .with_label_values(&[envelope.event_type.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => match self.store.mark_processed(&envelope.message_id).await {
                Ok(_) => {
                    tracing::info!(attempt = attempts, "Inbound message processed");
                    InboxOutcome::Processed
                }
                Err(e) => {
                    tracing::error!(error = %e, "Handler succeeded but marking processed failed");
                    InboxOutcome::StoreFailure {
                        error: e.to_string(),
                    }
                }
            },
            Err(HandlerError::Transient(reason))
                if attempts < self.config.max_delivery_attempts =>
            {
                tracing::warn!(
                    attempt = attempts,
                    max_attempts = self.config.max_delivery_attempts,
                    error = %reason,
                    "Handler failed, requesting redelivery"
                );
                if let Err(e) = self.store.mark_failed(&envelope.message_id, &reason).await {
                    tracing::error!(error = %e, "Failed to record handler failure");
                }
                InboxOutcome::Retry { attempts }
            }
            Err(e) => {
                let reason = match e {
                    HandlerError::Transient(reason) => format!(
                        "retries exhausted after {} attempts: {}",
                        attempts, reason
                    ),
                    HandlerError::Rejected(reason) => format!("rejected: {}", reason),
                };
                self.dead_letter(msg, &envelope, reason, attempts).await
            }
        }
    }

    async fn dead_letter(
        &self,
        msg: &BusMessage,
        envelope: &MessageEnvelope,
        reason: String,
        attempts: i32,
    ) -> InboxOutcome {
        // The inbox row is the audit trail; mark it first so a redelivery
        // after a failed dead-letter write is not handled again.
        if let Err(e) = self
            .store
            .mark_dead_lettered(&envelope.message_id, &reason)
            .await
        {
            tracing::error!(error = %e, "Failed to mark inbox row dead-lettered");
            return InboxOutcome::StoreFailure {
                error: e.to_string(),
            };
        }

        if record_dead_letter(
            self.dead_letters.as_ref(),
            msg,
            Some(envelope),
            &reason,
            attempts,
        )
        .await
        {
            InboxOutcome::DeadLettered { reason }
        } else {
            InboxOutcome::StoreFailure { error: reason }
        }
    }

    /// Consume all configured queues until cancelled
    ///
    /// In-flight deliveries are allowed to finish after cancellation; no new
    /// deliveries are taken.
    pub async fn run(&self, cancel: CancellationToken) -> BusResult<()> {
        let mut subscriptions = Vec::with_capacity(self.config.queues.len());
        for queue in &self.config.queues {
            subscriptions.push(self.bus.subscribe(queue).await?);
            tracing::info!(queue = %queue, "Subscribed to inbox queue");
        }

        tracing::info!(
            queues = self.config.queues.len(),
            prefetch = self.config.prefetch_count,
            "Starting inbox processor"
        );

        stream::select_all(subscriptions)
            .take_until(cancel.cancelled())
            .for_each_concurrent(self.config.prefetch_count, |delivery| async move {
                self.handle_delivery(delivery).await;
            })
            .await;

        tracing::info!("Inbox processor stopped");
        Ok(())
    }
}
