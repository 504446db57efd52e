//! API layer - HTTP endpoint handlers organized by resource.

mod health;
mod jobs;
mod metrics;
mod notifications;
mod notify;
mod routes;
mod template;
mod webhook;

use axum::{extract::rejection::JsonRejection, Json};

use crate::error::{AppError, Result};

pub use health::{health, HealthResponse};
pub use jobs::job_status;
pub use metrics::prometheus_metrics;
pub use notifications::{export_notifications, list_notifications, search_notifications};
pub use notify::{
    notify, notify_batch, notify_template, BatchItemResult, BatchRequest, BatchResponse,
    NotifyRequest, NotifyResponse, TemplateNotifyRequest, MAX_BATCH_SIZE,
};
pub use routes::{protected_routes, public_routes};
pub use template::list_templates;
pub use webhook::{webhook_test, WebhookTestRequest};

/// Turn a JSON body rejection into a validation error with a JSON body.
pub(crate) fn parse_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| AppError::Validation(e.body_text()))
}
