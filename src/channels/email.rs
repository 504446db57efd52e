use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, Message, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde_json::json;

use crate::config::SmtpConfig;
use crate::notification::Notification;

use super::{ChannelError, ChannelKind, DispatchResult};

/// Hands a finished message to a mail relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<(), ChannelError>;
}

/// SMTP relay transport backed by lettre.
pub struct SmtpMailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    timeout: Duration,
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, ChannelError> {
        let timeout = Duration::from_secs(config.timeout_seconds.max(1));

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                ChannelError::NotConfigured(format!("SMTP relay {}: {}", config.host, e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        builder = builder.port(config.port).timeout(Some(timeout));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            host: config.host.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn deliver(&self, message: Message) -> Result<(), ChannelError> {
        match tokio::time::timeout(self.timeout, self.mailer.send(message)).await {
            Ok(Ok(_response)) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::Transport(format!(
                "SMTP relay {}: {}",
                self.host, e
            ))),
            Err(_) => Err(ChannelError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// Sends the notification as an HTML mail to the recipient address.
pub struct EmailChannel {
    from: String,
    transport: Arc<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(from: impl Into<String>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            from: from.into(),
            transport,
        }
    }

    #[tracing::instrument(
        name = "channel.email",
        skip(self, notification),
        fields(notification_id = %notification.log_id())
    )]
    pub async fn send(&self, notification: &Notification) -> Result<DispatchResult, ChannelError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| ChannelError::NotConfigured(format!("sender '{}': {}", self.from, e)))?;
        let to: Mailbox = notification.recipient.parse().map_err(|e| {
            ChannelError::InvalidRecipient(format!("'{}': {}", notification.recipient, e))
        })?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(notification.subject.clone())
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(notification.message.clone()),
            )
            .map_err(|e| ChannelError::InvalidRecipient(format!("failed to build message: {e}")))?;

        self.transport.deliver(message).await?;

        tracing::debug!(recipient = %notification.recipient, "Email delivered to relay");

        Ok(DispatchResult::ok(
            ChannelKind::Email,
            json!({
                "sent_to": notification.recipient,
                "subject": notification.subject,
            }),
        ))
    }
}
