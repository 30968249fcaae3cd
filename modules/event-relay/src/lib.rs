//! Transactional outbox and idempotent inbox for the lending admin backend
//!
//! - [`dispatcher::OutboxDispatcher`] publishes rows written by
//!   [`repos::enqueue_in_tx`] to the event bus
//! - [`processor::InboxProcessor`] consumes inbound queues exactly once in
//!   effect, dispatching to [`handlers::HandlerRegistry`]
//! - [`cleanup::CleanupJob`] removes processed rows past their retention window

pub mod cleanup;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod dlq;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod repos;
pub mod routes;
pub mod routing;

pub use cleanup::{CleanupConfig, CleanupJob, CleanupReport};
pub use dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use handlers::{EventHandler, HandlerError, HandlerRegistry, InboxContext, RegistryError};
pub use processor::{InboxConfig, InboxOutcome, InboxProcessor};
pub use routing::QueueRouter;
