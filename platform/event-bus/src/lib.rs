//! # EventBus Abstraction
//!
//! The broker-facing half of the outbox/inbox relay. The relay never talks to a
//! broker client directly; it publishes and subscribes through [`EventBus`] so
//! the transport can be swapped by configuration.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream (durable
//!   streams, explicit acknowledgements, dead-letter stream)
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//!
//! ## Delivery semantics
//!
//! Subscriptions yield [`Delivery`] values. Every delivery must be settled
//! exactly once with [`Delivery::ack`], [`Delivery::nack`] (redeliver later) or
//! [`Delivery::reject`] (route to the dead-letter destination, never
//! redelivered). Delivery is at-least-once; consumers are expected to be
//! idempotent.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus, MessageEnvelope};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let mut deliveries = bus.subscribe("lendtech.user.events").await?;
//!
//! let envelope = MessageEnvelope::new(
//!     "UserCreated",
//!     serde_json::json!({ "userId": "123" }),
//!     uuid::Uuid::new_v4(),
//! );
//! bus.publish("lendtech.user.events", envelope.encode()?).await?;
//!
//! while let Some(delivery) = deliveries.next().await {
//!     println!("Received {} bytes on {}", delivery.message.payload.len(), delivery.message.subject);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_bus;
mod nats_bus;
pub mod retry;

pub use envelope::{EnvelopeError, MessageEnvelope, MAX_IDENTIFIER_LEN};
pub use inmemory_bus::{InMemoryBus, Settlement};
pub use nats_bus::{NatsBus, NatsTopology};
pub use retry::{retry_with_backoff, RetryConfig};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/queue this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<std::collections::HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: std::collections::HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Add a reply-to subject
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("failed to settle delivery: {0}")]
    AckError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// Processing finished (or the message is a known duplicate)
    Ack,
    /// Processing failed transiently; the broker should redeliver
    Nack,
    /// Poison message; route to the dead-letter destination
    Reject,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Ack => write!(f, "ack"),
            AckKind::Nack => write!(f, "nack"),
            AckKind::Reject => write!(f, "reject"),
        }
    }
}

/// Transport-specific settlement of a single delivery
///
/// `redeliver_after` only applies to [`AckKind::Nack`]; `None` asks for
/// immediate redelivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(
        &self,
        message: &BusMessage,
        delivery_count: u32,
        kind: AckKind,
        redeliver_after: Option<Duration>,
    ) -> BusResult<()>;
}

/// One broker delivery awaiting settlement
///
/// Settling consumes the delivery, so a message cannot be acknowledged twice.
pub struct Delivery {
    pub message: BusMessage,
    /// 1 for the first delivery, incremented on every redelivery
    pub delivery_count: u32,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(message: BusMessage, delivery_count: u32, acker: Arc<dyn Acker>) -> Self {
        Self {
            message,
            delivery_count,
            acker,
        }
    }

    pub async fn ack(self) -> BusResult<()> {
        self.settle(AckKind::Ack).await
    }

    pub async fn nack(self) -> BusResult<()> {
        self.settle(AckKind::Nack).await
    }

    /// Ask the broker to redeliver once `delay` has passed
    pub async fn nack_with_delay(self, delay: Duration) -> BusResult<()> {
        self.acker
            .settle(&self.message, self.delivery_count, AckKind::Nack, Some(delay))
            .await
    }

    pub async fn reject(self) -> BusResult<()> {
        self.settle(AckKind::Reject).await
    }

    pub async fn settle(self, kind: AckKind) -> BusResult<()> {
        self.acker
            .settle(&self.message, self.delivery_count, kind, None)
            .await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("payload_len", &self.message.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Core event bus abstraction for publish-subscribe messaging
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject/queue
    ///
    /// # Returns
    /// * `Ok(())` once the broker has accepted the message
    /// * `Err(BusError)` if publishing failed
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to deliveries for a queue
    ///
    /// The subject may use NATS wildcards (`*` one token, `>` one or more
    /// tokens). Deliveries are pushed by the broker; the stream ends when the
    /// subscription is closed.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, Delivery>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
