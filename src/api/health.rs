//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::notification::DispatcherStatsSnapshot;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub queue_size: usize,
    pub db_status: String,
    pub workers: usize,
    pub channels: Vec<&'static str>,
    pub dispatcher: DispatcherStatsSnapshot,
}

/// GET /health - Liveness plus store connectivity
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_health = state.store.ping().await;
    let status = if store_health.connected { "healthy" } else { "degraded" };

    if !store_health.connected {
        tracing::warn!(
            backend = store_health.backend,
            error = ?store_health.error,
            "Store health check failed"
        );
    }

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        queue_size: state.queue().queue_size(),
        db_status: store_health.describe(),
        workers: state.workers.worker_count(),
        channels: state.dispatcher.channels(),
        dispatcher: state.dispatcher.stats(),
    })
}
