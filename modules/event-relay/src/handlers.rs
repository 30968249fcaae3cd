//! Event handler registry for the inbox processor
//!
//! Business code registers one handler per event type at startup; the
//! processor looks the handler up by the envelope's `eventType` on every
//! delivery. Registration is closed once the registry is handed to the
//! processor (it is moved behind an `Arc`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// What a handler sees of one inbound message
#[derive(Debug, Clone)]
pub struct InboxContext {
    pub message_id: String,
    pub event_type: String,
    pub organization_id: Uuid,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// 1 on the first run of the handler for this message
    pub attempt: i32,
}

impl InboxContext {
    /// Decode `event_data`; a payload that does not fit is a poison message
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.event_data.clone()).map_err(|e| {
            HandlerError::Rejected(format!("invalid {} payload: {}", self.event_type, e))
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Infrastructure fault; the message is redelivered
    #[error("transient failure: {0}")]
    Transient(String),

    /// Business or payload fault; retrying cannot help
    #[error("rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &InboxContext) -> Result<(), HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(InboxContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &InboxContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler already registered for event type {0}")]
    DuplicateHandler(String),

    #[error("no handler registered for expected event types: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    expected: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            return Err(RegistryError::DuplicateHandler(event_type));
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(
        &mut self,
        event_type: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(InboxContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler { f }))
    }

    /// Declare event types that must have a handler before startup completes
    pub fn expect_types<I, S>(&mut self, event_types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for event_type in event_types {
            let event_type = event_type.into();
            if !self.expected.contains(&event_type) {
                self.expected.push(event_type);
            }
        }
    }

    pub fn verify(&self) -> Result<(), RegistryError> {
        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|t| !self.handlers.contains_key(t.as_str()))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingHandlers(missing))
        }
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .field("expected", &self.expected)
            .finish()
    }
}

/// Acknowledges an event by logging it
///
/// Stands in for the user and role projections until those services consume
/// their own queues.
pub struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn handle(&self, ctx: &InboxContext) -> Result<(), HandlerError> {
        tracing::info!(
            message_id = %ctx.message_id,
            event_type = %ctx.event_type,
            organization_id = %ctx.organization_id,
            attempt = ctx.attempt,
            "Handled inbound event"
        );
        Ok(())
    }
}

/// Registry with the built-in handlers for user and role events
pub fn default_registry() -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    let log: Arc<dyn EventHandler> = Arc::new(LogEventHandler);
    for event_type in ["UserCreated", "UserUpdated", "RoleAssigned"] {
        registry.register(event_type, log.clone())?;
    }
    Ok(registry)
}
