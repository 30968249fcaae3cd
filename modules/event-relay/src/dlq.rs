//! Dead-letter recording for inbound messages

use crate::models::NewFailedEvent;
use crate::repos::DeadLetterStore;
use event_bus::{BusMessage, MessageEnvelope};
use uuid::Uuid;

/// Write the failure to `failed_events`
///
/// When the envelope could not be decoded, the message id and organization
/// are recovered from the raw JSON where possible. Returns false if the
/// record could not be written; the caller should then leave the delivery to
/// the broker rather than drop it.
pub async fn record_dead_letter(
    store: &dyn DeadLetterStore,
    msg: &BusMessage,
    envelope: Option<&MessageEnvelope>,
    error: &str,
    attempts: i32,
) -> bool {
    let (message_id, organization_id) = match envelope {
        Some(env) => (Some(env.message_id.clone()), Some(env.organization_id)),
        None => salvage_identifiers(&msg.payload),
    };

    let failed = NewFailedEvent {
        message_id: message_id.clone(),
        subject: msg.subject.clone(),
        organization_id,
        envelope: String::from_utf8_lossy(&msg.payload).into_owned(),
        error: error.to_string(),
        attempts,
    };

    match store.record(failed).await {
        Ok(row) => {
            tracing::error!(
                failed_event_id = %row.id,
                message_id = message_id.as_deref().unwrap_or("unknown"),
                subject = %msg.subject,
                attempts,
                error = %error,
                "Message moved to dead-letter record"
            );
            true
        }
        Err(dlq_err) => {
            tracing::error!(
                message_id = message_id.as_deref().unwrap_or("unknown"),
                subject = %msg.subject,
                error = %error,
                dlq_error = %dlq_err,
                "Failed to write dead-letter record"
            );
            false
        }
    }
}

fn salvage_identifiers(payload: &[u8]) -> (Option<String>, Option<Uuid>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return (None, None);
    };

    let message_id = value
        .get("messageId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(event_bus::MAX_IDENTIFIER_LEN).collect());

    let organization_id = value
        .get("organizationId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());

    (message_id, organization_id)
}
