//! NATS JetStream implementation of the EventBus trait

use crate::{AckKind, Acker, BusError, BusMessage, BusResult, Delivery, EventBus};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    stream, AckKind as JsAckKind,
};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Streams, subjects and consumer limits the relay relies on
#[derive(Debug, Clone)]
pub struct NatsTopology {
    /// Durable stream holding every relay queue
    pub stream_name: String,
    /// Queue subjects captured by the stream
    pub subjects: Vec<String>,
    pub dead_letter_stream: String,
    pub dead_letter_subject: String,
    /// Broker-side message expiry (`max_age` of the events stream)
    pub message_ttl: Duration,
    /// Maximum unacknowledged deliveries per consumer
    pub prefetch_count: i64,
    /// Unacknowledged deliveries are redelivered after this long
    pub ack_wait: Duration,
}

impl Default for NatsTopology {
    fn default() -> Self {
        Self {
            stream_name: "LENDTECH_EVENTS".to_string(),
            subjects: vec![
                "lendtech.user.events".to_string(),
                "lendtech.organization.events".to_string(),
                "lendtech.financial.events".to_string(),
                "lendtech.default.events".to_string(),
            ],
            dead_letter_stream: "LENDTECH_DLQ".to_string(),
            dead_letter_subject: "lendtech.dlq".to_string(),
            message_ttl: Duration::from_millis(86_400_000),
            prefetch_count: 10,
            ack_wait: Duration::from_secs(330),
        }
    }
}

/// EventBus implementation using NATS JetStream
///
/// Publishing waits for the JetStream publish ack, so `Ok(())` means the
/// message is stored in the stream. Each subscription is a durable pull
/// consumer with explicit acks.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus, NatsTopology};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client, NatsTopology::default());
/// bus.ensure_topology().await?;
///
/// bus.publish("lendtech.user.events", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    topology: NatsTopology,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client, topology: NatsTopology) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            topology,
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn topology(&self) -> &NatsTopology {
        &self.topology
    }

    /// Create the events and dead-letter streams if they do not exist
    pub async fn ensure_topology(&self) -> BusResult<()> {
        let events_cfg = stream::Config {
            name: self.topology.stream_name.clone(),
            subjects: self.topology.subjects.clone(),
            max_age: self.topology.message_ttl,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(events_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let dlq_cfg = stream::Config {
            name: self.topology.dead_letter_stream.clone(),
            subjects: vec![self.topology.dead_letter_subject.clone()],
            max_age: Duration::from_secs(60 * 60 * 24 * 30),
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(dlq_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        tracing::info!(
            stream = %self.topology.stream_name,
            dead_letter_stream = %self.topology.dead_letter_stream,
            "JetStream topology ensured"
        );

        Ok(())
    }

    fn durable_name(subject: &str) -> String {
        let sanitized: String = subject
            .chars()
            .map(|c| match c {
                '.' | '*' | '>' | ' ' => '_',
                other => other,
            })
            .collect();
        format!("relay_{}", sanitized)
    }
}

/// Settles one JetStream message
struct JetStreamAcker {
    message: jetstream::Message,
    jetstream: jetstream::Context,
    dead_letter_subject: String,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn settle(
        &self,
        message: &BusMessage,
        _delivery_count: u32,
        kind: AckKind,
        redeliver_after: Option<Duration>,
    ) -> BusResult<()> {
        let settled = match kind {
            AckKind::Ack => self.message.ack().await,
            AckKind::Nack => self.message.ack_with(JsAckKind::Nak(redeliver_after)).await,
            AckKind::Reject => {
                // Park the payload on the dead-letter stream before terminating,
                // otherwise a failed republish would lose the message.
                self.jetstream
                    .publish(self.dead_letter_subject.clone(), message.payload.clone().into())
                    .await
                    .map_err(|e| BusError::AckError(e.to_string()))?
                    .await
                    .map_err(|e| BusError::AckError(e.to_string()))?;
                self.message.ack_with(JsAckKind::Term).await
            }
        };
        settled.map_err(|e| BusError::AckError(e.to_string()))
    }
}

fn to_bus_message(nats_msg: &jetstream::Message) -> BusMessage {
    let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

    if let Some(reply) = &nats_msg.reply {
        msg = msg.with_reply_to(reply.to_string());
    }

    if let Some(nats_headers) = &nats_msg.headers {
        let mut headers = std::collections::HashMap::new();
        for (key, values) in nats_headers.iter() {
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, Delivery>> {
        let events = self
            .jetstream
            .get_stream(&self.topology.stream_name)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let durable = Self::durable_name(subject);
        let consumer = events
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: self.topology.prefetch_count,
                    ack_wait: self.topology.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let jetstream = self.jetstream.clone();
        let dead_letter_subject = self.topology.dead_letter_subject.clone();

        let stream = messages.filter_map(move |result| {
            let jetstream = jetstream.clone();
            let dead_letter_subject = dead_letter_subject.clone();
            async move {
                match result {
                    Ok(nats_msg) => {
                        let message = to_bus_message(&nats_msg);
                        let delivery_count = nats_msg
                            .info()
                            .map(|info| info.delivered.max(1) as u32)
                            .unwrap_or(1);
                        let acker: Arc<dyn Acker> = Arc::new(JetStreamAcker {
                            message: nats_msg,
                            jetstream,
                            dead_letter_subject,
                        });
                        Some(Delivery::new(message, delivery_count, acker))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "JetStream consumer error, skipping");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_name_is_sanitized() {
        assert_eq!(
            NatsBus::durable_name("lendtech.user.events"),
            "relay_lendtech_user_events"
        );
        assert_eq!(NatsBus::durable_name("lendtech.>"), "relay_lendtech__");
    }

    // Note: These tests require a running NATS server with JetStream enabled
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let topology = NatsTopology {
            stream_name: "RELAY_TEST_EVENTS".to_string(),
            subjects: vec!["relaytest.user.events".to_string()],
            dead_letter_stream: "RELAY_TEST_DLQ".to_string(),
            dead_letter_subject: "relaytest.dlq".to_string(),
            ..Default::default()
        };
        let bus = NatsBus::new(client, topology);
        bus.ensure_topology().await.unwrap();

        let mut stream = bus.subscribe("relaytest.user.events").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("relaytest.user.events", payload.clone())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(delivery.message.subject, "relaytest.user.events");
        assert_eq!(delivery.message.payload, payload);
        delivery.ack().await.unwrap();
    }
}
