//! # Message Envelope
//!
//! Wire format for every event the relay publishes and consumes.
//!
//! ```json
//! {
//!   "eventType": "UserCreated",
//!   "eventData": { "userId": "..." },
//!   "messageId": "4f0c...",
//!   "organizationId": "550e8400-e29b-41d4-a716-446655440000",
//!   "createdAt": "2024-01-01T00:00:00Z"
//! }
//! ```
//!
//! - `eventType`: logical event name, used for routing and handler lookup
//! - `eventData`: event body, an opaque JSON object
//! - `messageId`: deduplication key; the consumer's inbox is keyed on it
//! - `organizationId`: tenant identifier
//! - `createdAt`: RFC 3339 timestamp of the original outbox write

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BusError, BusResult};

/// Column limit shared by `messageId` and `eventType`
pub const MAX_IDENTIFIER_LEN: usize = 200;

/// Reasons an inbound payload is not a usable envelope
///
/// All of these are poison faults: redelivering the same bytes cannot fix them.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope field {0} must not be empty")]
    EmptyField(&'static str),

    #[error("envelope field {field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("eventData must be a JSON object")]
    InvalidEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub message_id: String,
    pub organization_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Create an envelope with a fresh message id and the current time
    pub fn new(
        event_type: impl Into<String>,
        event_data: serde_json::Value,
        organization_id: Uuid,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            message_id: Uuid::new_v4().to_string(),
            organization_id,
            created_at: Utc::now(),
        }
    }

    /// Override the message id (producer-assigned deduplication key)
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Serialize to the JSON wire format
    pub fn encode(&self) -> BusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::SerializationError(e.to_string()))
    }

    /// Parse and validate an inbound payload
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: MessageEnvelope =
            serde_json::from_slice(payload).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the field constraints the inbox table relies on
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        check_identifier("messageId", &self.message_id)?;
        check_identifier("eventType", &self.event_type)?;

        if !self.event_data.is_object() {
            return Err(EnvelopeError::InvalidEventData);
        }

        Ok(())
    }
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        return Err(EnvelopeError::EmptyField(field));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(EnvelopeError::FieldTooLong {
            field,
            max: MAX_IDENTIFIER_LEN,
        });
    }
    Ok(())
}
