//! Delivery channels.
//!
//! The set of channels is fixed: email, webhook, Slack and file. Each one
//! is a concrete type wrapped by the [`Channel`] enum, and every channel is
//! shared read-only by all concurrent deliveries.

mod email;
mod file;
mod slack;
mod webhook;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::config::ChannelsConfig;
use crate::notification::Notification;

pub use email::{EmailChannel, MailTransport, SmtpMailTransport};
pub use file::FileChannel;
pub use slack::SlackChannel;
pub use webhook::{WebhookChannel, WebhookResponse};

/// Longest response body snippet kept in a result
pub(crate) const MAX_RESPONSE_SNIPPET: usize = 4096;

/// Errors raised while delivering through a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery timed out after {0}s")]
    Timeout(u64),

    #[error("Remote endpoint returned status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Path escapes log directory: {0}")]
    PathEscape(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Errors caused by the request itself; retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ChannelError::NotConfigured(_)
                | ChannelError::InvalidRecipient(_)
                | ChannelError::InvalidRequest(_)
                | ChannelError::PathEscape(_)
        )
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchResult {
    pub success: bool,
    pub channel: String,
    /// Channel specific payload (status code, file written, ...)
    pub response: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn ok(channel: ChannelKind, response: serde_json::Value) -> Self {
        Self {
            success: true,
            channel: channel.as_str().to_string(),
            response,
            error: None,
        }
    }

    pub fn failed(channel: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            channel: channel.into(),
            response: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Names of the registered delivery media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Webhook,
    Slack,
    File,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Email,
        ChannelKind::Webhook,
        ChannelKind::Slack,
        ChannelKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Slack => "slack",
            ChannelKind::File => "file",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(ChannelKind::Email),
            "webhook" => Ok(ChannelKind::Webhook),
            "slack" => Ok(ChannelKind::Slack),
            "file" => Ok(ChannelKind::File),
            other => Err(other.to_string()),
        }
    }
}

/// A delivery channel.
pub enum Channel {
    Email(EmailChannel),
    Webhook(WebhookChannel),
    Slack(SlackChannel),
    File(FileChannel),
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Email(_) => ChannelKind::Email,
            Channel::Webhook(_) => ChannelKind::Webhook,
            Channel::Slack(_) => ChannelKind::Slack,
            Channel::File(_) => ChannelKind::File,
        }
    }

    /// Deliver one notification.
    pub async fn send(&self, notification: &Notification) -> Result<DispatchResult, ChannelError> {
        match self {
            Channel::Email(c) => c.send(notification).await,
            Channel::Webhook(c) => c.send(notification).await,
            Channel::Slack(c) => c.send(notification).await,
            Channel::File(c) => c.send(notification).await,
        }
    }
}

impl From<EmailChannel> for Channel {
    fn from(c: EmailChannel) -> Self {
        Channel::Email(c)
    }
}

impl From<WebhookChannel> for Channel {
    fn from(c: WebhookChannel) -> Self {
        Channel::Webhook(c)
    }
}

impl From<SlackChannel> for Channel {
    fn from(c: SlackChannel) -> Self {
        Channel::Slack(c)
    }
}

impl From<FileChannel> for Channel {
    fn from(c: FileChannel) -> Self {
        Channel::File(c)
    }
}

/// Build all four channels from configuration.
pub fn create_channels(config: &ChannelsConfig) -> Result<Vec<Channel>, ChannelError> {
    let http = reqwest::Client::builder()
        .timeout(config.webhook_timeout())
        .user_agent(concat!("notify-dispatch-service/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ChannelError::Transport(format!("failed to build HTTP client: {e}")))?;

    let email = EmailChannel::new(
        config.smtp.from.clone(),
        std::sync::Arc::new(SmtpMailTransport::new(&config.smtp)?),
    );
    let webhook = WebhookChannel::new(http.clone(), config.webhook_timeout_seconds);
    let slack = SlackChannel::new(http, config.slack_webhook.clone(), config.webhook_timeout_seconds);
    let file = FileChannel::new(&config.log_dir)?;

    tracing::info!(
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        slack_configured = !config.slack_webhook.is_empty(),
        log_dir = %config.log_dir,
        "Delivery channels initialized"
    );

    Ok(vec![email.into(), webhook.into(), slack.into(), file.into()])
}

/// Read at most [`MAX_RESPONSE_SNIPPET`] bytes of a response body.
///
/// Stops pulling chunks once the cap is reached, so large bodies are never
/// buffered whole.
pub(crate) async fn read_snippet(mut response: reqwest::Response) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = MAX_RESPONSE_SNIPPET - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= MAX_RESPONSE_SNIPPET {
            break;
        }
    }
    Ok(truncate_snippet(String::from_utf8_lossy(&buf).into_owned()))
}

/// Keep at most [`MAX_RESPONSE_SNIPPET`] bytes of a remote response body.
pub(crate) fn truncate_snippet(mut body: String) -> String {
    if body.len() > MAX_RESPONSE_SNIPPET {
        let mut cut = MAX_RESPONSE_SNIPPET;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
