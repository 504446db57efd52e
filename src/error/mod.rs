use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::channels::ChannelError;
use crate::notification::DispatchError;
use crate::queue::QueueError;
use crate::store::StoreError;
use crate::template::TemplateError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Webhook request failed: {0}")]
    Webhook(#[from] ChannelError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn masked(message: String, public: &str) -> String {
    if is_production() {
        public.to_string()
    } else {
        message
    }
}

fn channel_status(error: &ChannelError) -> (StatusCode, &'static str) {
    match error {
        ChannelError::InvalidRecipient(_)
        | ChannelError::InvalidRequest(_)
        | ChannelError::PathEscape(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        ChannelError::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, "CHANNEL_NOT_CONFIGURED"),
        ChannelError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TRANSPORT_TIMEOUT"),
        _ => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
    }
}

impl AppError {
    /// HTTP status and stable error code for this error.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Template(e) => match e {
                TemplateError::NotFound(_) => (StatusCode::NOT_FOUND, "TEMPLATE_NOT_FOUND"),
                TemplateError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TEMPLATE_IO_ERROR"),
                _ => (StatusCode::BAD_REQUEST, "TEMPLATE_ERROR"),
            },
            AppError::Dispatch(DispatchError::UnknownChannel(_)) => (StatusCode::NOT_FOUND, "UNKNOWN_CHANNEL"),
            AppError::Dispatch(DispatchError::Channel { source, .. }) => channel_status(source),
            AppError::Webhook(e) => channel_status(e),
            AppError::Queue(QueueError::Full(_)) | AppError::Queue(QueueError::Closed) => {
                (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_UNAVAILABLE")
            }
            AppError::Queue(_) => (StatusCode::INTERNAL_SERVER_ERROR, "QUEUE_ERROR"),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let log_message = self.to_string();

        let client_message = match &self {
            AppError::Config(_) => masked(log_message.clone(), "Configuration error"),
            AppError::Store(_) | AppError::Queue(QueueError::Store(_)) => {
                masked(log_message.clone(), "Storage temporarily unavailable")
            }
            AppError::Internal(_) | AppError::Template(TemplateError::Io(_)) => {
                masked(log_message.clone(), "Internal server error")
            }
            _ => log_message.clone(),
        };

        // Always log the detailed error server-side
        if status.is_server_error() {
            tracing::error!(code = %code, status = %status.as_u16(), message = %log_message, "API error");
        } else {
            tracing::warn!(code = %code, status = %status.as_u16(), message = %log_message, "API error");
        }

        let retry_after = match &self {
            AppError::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: client_message,
                code,
            }),
        )
            .into_response();

        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
