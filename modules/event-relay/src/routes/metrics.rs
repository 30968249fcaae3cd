use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::repos::{InboxStore, OutboxStore};

#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Metrics,
    pub outbox: Arc<dyn OutboxStore>,
    pub inbox: Arc<dyn InboxStore>,
}

pub async fn metrics(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    // Stale gauges are better than no scrape
    if let Err(e) = state
        .metrics
        .refresh_backlog(state.outbox.as_ref(), state.inbox.as_ref())
        .await
    {
        tracing::warn!(error = %e, "Failed to refresh backlog gauges");
    }

    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics error: {e}")),
    }
}
