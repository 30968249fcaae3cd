pub mod health;
pub mod metrics;

use axum::{routing::get, Router};
use std::sync::Arc;

pub fn router(health: Arc<health::HealthState>, metrics: Arc<metrics::MetricsState>) -> Router {
    let health_routes = Router::new()
        .route("/api/health", get(health::health_live))
        .route("/api/ready", get(health::health_ready))
        .with_state(health);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics))
        .with_state(metrics);

    health_routes.merge(metrics_routes)
}
