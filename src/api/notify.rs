//! Notification submission endpoints.

use std::collections::HashMap;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::parse_body;
use crate::channels::{ChannelKind, DispatchResult};
use crate::error::{AppError, Result};
use crate::notification::{DispatchError, Notification, NotificationStatus};
use crate::queue::Job;
use crate::server::AppState;

/// Most notifications accepted in one batch request
pub const MAX_BATCH_SIZE: usize = 100;

/// A single notification as submitted over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyRequest {
    pub channel: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message: String,
    /// Template rendered into `message` before delivery
    pub template: Option<String>,
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
}

impl NotifyRequest {
    fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(AppError::Validation("channel is required".to_string()));
        }
        // Slack posts to its configured webhook and file picks a default name
        let recipient_optional = matches!(
            self.channel.parse::<ChannelKind>(),
            Ok(ChannelKind::Slack) | Ok(ChannelKind::File)
        );
        if !recipient_optional && self.recipient.trim().is_empty() {
            return Err(AppError::Validation("recipient is required".to_string()));
        }
        if matches!(&self.template, Some(name) if name.trim().is_empty()) {
            return Err(AppError::Validation("template name must not be empty".to_string()));
        }
        Ok(())
    }

    fn data(&self) -> Value {
        self.data.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }

    fn to_notification(&self, message: String) -> Notification {
        Notification::builder(&self.channel, &self.recipient)
            .subject(&self.subject)
            .message(message)
            .metadata_map(self.metadata.clone())
            .priority(self.priority)
            .build()
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub notifications: Vec<NotifyRequest>,
    #[serde(rename = "async", default)]
    pub run_async: bool,
}

#[derive(Debug, Deserialize)]
pub struct TemplateNotifyRequest {
    pub template: String,
    pub channel: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
}

impl From<TemplateNotifyRequest> for NotifyRequest {
    fn from(request: TemplateNotifyRequest) -> Self {
        Self {
            channel: request.channel,
            recipient: request.recipient,
            subject: request.subject,
            message: String::new(),
            template: Some(request.template),
            data: request.data,
            metadata: request.metadata,
            priority: request.priority,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub id: i64,
    pub status: NotificationStatus,
    pub result: DispatchResult,
}

/// Outcome of one batch item, in request order.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchItemResult {
    Queued {
        queued: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Delivered {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        status: NotificationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<DispatchResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub processed: usize,
    pub results: Vec<BatchItemResult>,
}

/// Render a template the way the target channel needs it.
///
/// Email bodies are HTML, so only email takes the escaping path.
async fn render_message(state: &AppState, request: &NotifyRequest, template: &str) -> Result<String> {
    let data = request.data();
    let rendered = if request.channel == ChannelKind::Email.as_str() {
        state.renderer.render(template, &data).await?
    } else {
        state.renderer.render_text(template, &data).await?
    };
    Ok(rendered)
}

type Delivery = std::result::Result<(i64, DispatchResult), (Option<i64>, AppError)>;

/// Validate, render, record and dispatch one notification synchronously.
#[tracing::instrument(
    name = "http.deliver",
    skip(state, request),
    fields(
        channel = %request.channel,
        template = ?request.template,
        notification_id = tracing::field::Empty
    )
)]
async fn deliver(state: &AppState, request: &NotifyRequest) -> Delivery {
    let prepared = async {
        request.validate()?;
        if !state.dispatcher.has_channel(&request.channel) {
            return Err(DispatchError::UnknownChannel(request.channel.clone()).into());
        }
        let message = match &request.template {
            Some(template) => render_message(state, request, template).await?,
            None => request.message.clone(),
        };
        Ok::<_, AppError>(request.to_notification(message))
    };
    let notification = prepared.await.map_err(|e| (None, e))?;

    let id = state
        .store
        .save_notification(&notification)
        .await
        .map_err(|e| (None, e.into()))?;
    tracing::Span::current().record("notification_id", id);

    match state.dispatcher.dispatch(&notification).await {
        Ok(result) => {
            state
                .store
                .update_status(id, NotificationStatus::Sent, None)
                .await
                .map_err(|e| (Some(id), e.into()))?;
            Ok((id, result))
        }
        Err(e) => {
            let message = e.to_string();
            state
                .store
                .update_status(id, NotificationStatus::Failed, Some(&message))
                .await
                .map_err(|e| (Some(id), e.into()))?;
            Err((Some(id), e.into()))
        }
    }
}

fn build_job(state: &AppState, request: &NotifyRequest) -> Result<Job> {
    request.validate()?;
    let job = Job::new(
        request.to_notification(request.message.clone()),
        state.settings.queue.max_attempts,
    );
    Ok(match &request.template {
        Some(template) => job.with_template(template, request.data()),
        None => job,
    })
}

/// POST /notify - Render (optionally) and deliver one notification now
pub async fn notify(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<Json<NotifyResponse>> {
    let request = parse_body(payload)?;
    let (id, result) = deliver(&state, &request).await.map_err(|(_, e)| e)?;

    Ok(Json(NotifyResponse {
        id,
        status: NotificationStatus::Sent,
        result,
    }))
}

/// POST /notify/template - Render a named template and deliver it
pub async fn notify_template(
    State(state): State<AppState>,
    payload: std::result::Result<Json<TemplateNotifyRequest>, JsonRejection>,
) -> Result<Json<NotifyResponse>> {
    let request = NotifyRequest::from(parse_body(payload)?);
    let (id, result) = deliver(&state, &request).await.map_err(|(_, e)| e)?;

    Ok(Json(NotifyResponse {
        id,
        status: NotificationStatus::Sent,
        result,
    }))
}

/// POST /notify/batch - Deliver or enqueue several notifications
#[tracing::instrument(
    name = "http.notify_batch",
    skip(state, payload)
)]
pub async fn notify_batch(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>> {
    let batch = parse_body(payload)?;
    if batch.notifications.is_empty() {
        return Err(AppError::Validation("notifications must not be empty".to_string()));
    }
    if batch.notifications.len() > MAX_BATCH_SIZE {
        return Err(AppError::Validation(format!(
            "at most {} notifications per batch",
            MAX_BATCH_SIZE
        )));
    }

    let results = if batch.run_async {
        let mut results = Vec::with_capacity(batch.notifications.len());
        for request in &batch.notifications {
            let enqueued = match build_job(&state, request) {
                Ok(job) => state.queue().enqueue(job).await.map_err(AppError::from),
                Err(e) => Err(e),
            };
            results.push(match enqueued {
                Ok(job_id) => BatchItemResult::Queued {
                    queued: true,
                    job_id: Some(job_id),
                    error: None,
                },
                Err(e) => BatchItemResult::Queued {
                    queued: false,
                    job_id: None,
                    error: Some(e.to_string()),
                },
            });
        }
        results
    } else {
        let deliveries = join_all(batch.notifications.iter().map(|request| deliver(&state, request))).await;
        deliveries
            .into_iter()
            .map(|delivery| match delivery {
                Ok((id, result)) => BatchItemResult::Delivered {
                    id: Some(id),
                    status: NotificationStatus::Sent,
                    result: Some(result),
                    error: None,
                },
                Err((id, e)) => BatchItemResult::Delivered {
                    id,
                    status: NotificationStatus::Failed,
                    result: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    };

    tracing::info!(
        processed = results.len(),
        run_async = batch.run_async,
        "Batch processed"
    );

    Ok(Json(BatchResponse {
        processed: results.len(),
        results,
    }))
}
