use chrono::{DateTime, Utc};
use event_bus::{MessageEnvelope, MAX_IDENTIFIER_LEN};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A row of `outbox_events`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub organization_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub poisoned_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned_at.is_some()
    }

    /// Wire envelope for this row
    ///
    /// The message id is the row id, so a row published twice (crash between
    /// publish and mark) reaches consumers with the same deduplication key.
    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope::new(
            self.event_type.clone(),
            self.event_data.clone(),
            self.organization_id,
        )
        .with_message_id(self.id.to_string())
        .with_created_at(self.created_at)
    }
}

/// Input for an outbox insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub organization_id: Uuid,
}

impl NewOutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        event_data: serde_json::Value,
        organization_id: Uuid,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            organization_id,
        }
    }

    /// Serialize a typed payload as the event body
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
        organization_id: Uuid,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            event_type,
            serde_json::to_value(payload)?,
            organization_id,
        ))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.event_type.trim().is_empty() {
            return Err("event_type must not be empty".to_string());
        }
        if self.event_type.chars().count() > MAX_IDENTIFIER_LEN {
            return Err(format!(
                "event_type exceeds {} characters",
                MAX_IDENTIFIER_LEN
            ));
        }
        if !self.event_data.is_object() {
            return Err("event_data must be a JSON object".to_string());
        }
        Ok(())
    }
}

/// A row of `inbox_events`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InboxEvent {
    pub id: Uuid,
    pub message_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub organization_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl InboxEvent {
    pub fn from_envelope(envelope: &MessageEnvelope, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: envelope.message_id.clone(),
            event_type: envelope.event_type.clone(),
            event_data: envelope.event_data.clone(),
            organization_id: envelope.organization_id,
            created_at: now,
            processed_at: None,
            attempts: 1,
            last_error: None,
            claimed_at: Some(now),
            dead_lettered_at: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Result of recording an inbound message before handling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This delivery owns the message; `attempts` counts handler runs including this one
    Started { attempts: i32 },
    /// A previous delivery completed the handler
    AlreadyProcessed,
    /// Another delivery of the same message holds a live claim
    InFlight,
    /// The message was routed to the dead-letter record earlier
    DeadLettered,
}

/// A row of `failed_events` (dead-letter record)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FailedEvent {
    pub id: Uuid,
    pub message_id: Option<String>,
    pub subject: String,
    pub organization_id: Option<Uuid>,
    pub envelope: String,
    pub error: String,
    pub attempts: i32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFailedEvent {
    pub message_id: Option<String>,
    pub subject: String,
    pub organization_id: Option<Uuid>,
    pub envelope: String,
    pub error: String,
    pub attempts: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxBacklog {
    /// Unprocessed and still eligible for dispatch
    pub pending: i64,
    /// Unprocessed and excluded until an operator re-queues them
    pub poisoned: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboxBacklog {
    pub unprocessed: i64,
    pub dead_lettered: i64,
}
