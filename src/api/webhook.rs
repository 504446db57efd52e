//! Ad-hoc webhook test endpoint.

use std::collections::HashMap;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use super::parse_body;
use crate::channels::WebhookResponse;
use crate::error::{AppError, Result};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookTestRequest {
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Sent verbatim when a string, serialized as JSON otherwise
    #[serde(default)]
    pub body: Value,
}

impl WebhookTestRequest {
    fn body_text(&self) -> Result<String> {
        match &self.body {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s.clone()),
            other => serde_json::to_string(other)
                .map_err(|e| AppError::Validation(format!("invalid body: {}", e))),
        }
    }
}

/// POST /webhook/test - Send one request to an http(s) URL and report the reply
#[tracing::instrument(
    name = "http.webhook_test",
    skip(state, payload)
)]
pub async fn webhook_test(
    State(state): State<AppState>,
    payload: std::result::Result<Json<WebhookTestRequest>, JsonRejection>,
) -> Result<Json<WebhookResponse>> {
    let request = parse_body(payload)?;
    let webhook = state
        .dispatcher
        .webhook()
        .ok_or_else(|| AppError::NotFound("webhook channel is not registered".to_string()))?;

    let body = request.body_text()?;
    let response = webhook
        .send_to_url(&request.url, &request.method, &request.headers, body)
        .await?;

    tracing::info!(
        url = %response.url,
        method = %response.method,
        status_code = response.status_code,
        "Webhook test completed"
    );
    Ok(Json(response))
}
