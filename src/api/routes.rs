use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::health::health;
use super::jobs::job_status;
use super::metrics::prometheus_metrics;
use super::notifications::{export_notifications, list_notifications, search_notifications};
use super::notify::{notify, notify_batch, notify_template};
use super::template::list_templates;
use super::webhook::webhook_test;

/// Routes reachable without an API key
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
}

/// Routes behind API key authentication and rate limiting
pub fn protected_routes() -> Router<AppState> {
    Router::new()
        // Delivery
        .route("/notify", post(notify))
        .route("/notify/batch", post(notify_batch))
        .route("/notify/template", post(notify_template))
        // Stored notifications
        .route("/notifications", get(list_notifications))
        .route("/notifications/search", get(search_notifications))
        .route("/notifications/export", get(export_notifications))
        // Queue
        .route("/jobs/{id}", get(job_status))
        // Tools
        .route("/webhook/test", post(webhook_test))
        .route("/templates", get(list_templates))
}
