//! In-memory implementation of the EventBus trait for testing and development

use crate::{AckKind, Acker, BusMessage, BusResult, Delivery, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_DEAD_LETTER_SUBJECT: &str = "lendtech.dlq";

/// Record of one delivery settlement, kept for inspection in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub subject: String,
    pub delivery_count: u32,
    pub kind: AckKind,
    pub redeliver_after: Option<Duration>,
}

struct Inner {
    sender: broadcast::Sender<(BusMessage, u32)>,
    dead_letter_subject: String,
    settlements: Mutex<Vec<Settlement>>,
}

/// EventBus implementation using in-memory channels
///
/// Messages are broadcast to all subscribers whose pattern matches. Settlement
/// mimics a broker with explicit acks:
/// - `nack` re-broadcasts the message with `delivery_count + 1`, after the
///   requested delay if any
/// - `reject` re-publishes the payload to the dead-letter subject
///
/// # Example
/// ```rust
/// use event_bus::{AckKind, EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus.subscribe("test.events.>").await?;
///
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// let delivery = stream.next().await.unwrap();
/// assert_eq!(delivery.message.subject, "test.events.created");
/// delivery.ack().await?;
///
/// assert_eq!(bus.settlements()[0].kind, AckKind::Ack);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Create a bus buffering up to 1000 undelivered messages
    ///
    /// Subscribers that fall further behind lose the oldest messages.
    pub fn new() -> Self {
        Self::build(1000, DEFAULT_DEAD_LETTER_SUBJECT.to_string())
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        Self::build(buffer_size, DEFAULT_DEAD_LETTER_SUBJECT.to_string())
    }

    /// Create a bus that routes rejected deliveries to a custom subject
    pub fn with_dead_letter_subject(dead_letter_subject: impl Into<String>) -> Self {
        Self::build(1000, dead_letter_subject.into())
    }

    fn build(buffer_size: usize, dead_letter_subject: String) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            inner: Arc::new(Inner {
                sender,
                dead_letter_subject,
                settlements: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn dead_letter_subject(&self) -> &str {
        &self.inner.dead_letter_subject
    }

    /// Every settlement made so far, in order
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner
            .settlements
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Live subscriptions (including ones whose pattern matches nothing)
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Number of settlements of the given kind
    pub fn settlement_count(&self, kind: AckKind) -> usize {
        self.settlements().iter().filter(|s| s.kind == kind).count()
    }

    /// NATS subject matching: `*` is one token, a trailing `>` is the rest
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Acker for Inner {
    async fn settle(
        &self,
        message: &BusMessage,
        delivery_count: u32,
        kind: AckKind,
        redeliver_after: Option<Duration>,
    ) -> BusResult<()> {
        if let Ok(mut settlements) = self.settlements.lock() {
            settlements.push(Settlement {
                subject: message.subject.clone(),
                delivery_count,
                kind,
                redeliver_after,
            });
        }

        // No receivers is fine: nobody is listening for the redelivery
        match kind {
            AckKind::Ack => {}
            AckKind::Nack => match redeliver_after.filter(|d| !d.is_zero()) {
                None => {
                    let _ = self.sender.send((message.clone(), delivery_count + 1));
                }
                Some(delay) => {
                    let sender = self.sender.clone();
                    let message = message.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = sender.send((message, delivery_count + 1));
                    });
                }
            },
            AckKind::Reject => {
                let dead = BusMessage::new(self.dead_letter_subject.clone(), message.payload.clone());
                let _ = self.sender.send((dead, 1));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let msg = BusMessage::new(subject.to_string(), payload);

        // Publishing with no subscriber drops the message, as core NATS does
        let _ = self.inner.sender.send((msg, 1));

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, Delivery>> {
        let mut receiver = self.inner.sender.subscribe();
        let pattern = pattern.to_string();
        let acker: Arc<dyn Acker> = self.inner.clone();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok((msg, delivery_count)) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield Delivery::new(msg, delivery_count, acker.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, pattern = %pattern, "InMemoryBus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
