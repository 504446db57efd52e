use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};

use super::AppState;
use crate::error::AppError;
use crate::ratelimit::RateLimitResult;

const API_KEY_HEADER: &str = "X-API-Key";

fn api_key(req: &Request<Body>) -> Option<&str> {
    req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

/// API Key authentication middleware
/// Validates X-API-Key header against configured api.key
pub async fn api_key_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    // If no API key is configured, allow all requests (development mode)
    let Some(expected_key) = &state.settings.api.key else {
        return Ok(next.run(req).await);
    };

    match api_key(&req) {
        Some(key) if key == expected_key => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "Invalid API key provided");
            Err(AppError::Unauthorized("invalid API key".to_string()))
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "Missing API key header");
            Err(AppError::Unauthorized("missing X-API-Key header".to_string()))
        }
    }
}

/// Rate limiting middleware for HTTP API requests.
///
/// Uses API key or client IP as the rate limit key.
/// Returns 429 Too Many Requests with Retry-After header when rate limited.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    if !state.settings.ratelimit.enabled {
        return Ok(next.run(req).await);
    }

    let key = match api_key(&req) {
        Some(key) => format!("key:{}", key),
        None => match req.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
            None => "ip:unknown".to_string(),
        },
    };

    match state.rate_limiter.check(&key) {
        RateLimitResult::Allowed => Ok(next.run(req).await),
        RateLimitResult::Limited { retry_after_seconds } => {
            tracing::warn!(
                client = %key,
                retry_after = retry_after_seconds,
                "Rate limit exceeded"
            );
            Err(AppError::RateLimited { retry_after_seconds })
        }
    }
}
