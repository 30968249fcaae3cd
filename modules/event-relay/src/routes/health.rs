use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct HealthState {
    pub db: PgPool,
    /// None when running on the in-memory bus
    pub nats: Option<async_nats::Client>,
    pub metrics: Metrics,
}

pub async fn health_live() -> StatusCode {
    StatusCode::OK
}

pub async fn health_ready(
    State(state): State<Arc<HealthState>>,
) -> Result<Json<Value>, StatusCode> {
    let db_up = sqlx::query("SELECT 1").fetch_one(&state.db).await.is_ok();
    state
        .metrics
        .dep_up
        .with_label_values(&["db"])
        .set(i64::from(db_up));
    if !db_up {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let nats = match &state.nats {
        Some(client) => {
            let up = client.connection_state() == async_nats::connection::State::Connected;
            state
                .metrics
                .dep_up
                .with_label_values(&["nats"])
                .set(i64::from(up));
            if !up {
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            "connected"
        }
        None => "inmemory",
    };

    Ok(Json(json!({
        "status": "ready",
        "database": "connected",
        "bus": nats
    })))
}
