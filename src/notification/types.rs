use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A notification to deliver through one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    /// Assigned by the store on first save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Name of the registered channel ("email", "webhook", "slack", "file")
    pub channel: String,
    /// Address, URL or file name depending on the channel
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Advisory; higher values are picked up first by the queue
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Delivery status of a stored notification.
///
/// `Pending` moves to exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationStatus::Pending)
    }

    /// Whether a stored record in `self` may move to `next`.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        matches!(
            (self, next),
            (NotificationStatus::Pending, NotificationStatus::Sent)
                | (NotificationStatus::Pending, NotificationStatus::Failed)
        )
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// Builder for creating notifications
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    channel: String,
    recipient: String,
    subject: String,
    message: String,
    metadata: HashMap<String, String>,
    priority: i32,
}

impl NotificationBuilder {
    pub fn new(channel: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            recipient: recipient.into(),
            subject: String::new(),
            message: String::new(),
            metadata: HashMap::new(),
            priority: 0,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_map(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> Notification {
        Notification {
            id: None,
            channel: self.channel,
            recipient: self.recipient,
            subject: self.subject,
            message: self.message,
            status: NotificationStatus::Pending,
            error: None,
            metadata: self.metadata,
            priority: self.priority,
            created_at: Utc::now(),
            sent_at: None,
        }
    }
}

impl Notification {
    pub fn builder(channel: impl Into<String>, recipient: impl Into<String>) -> NotificationBuilder {
        NotificationBuilder::new(channel, recipient)
    }

    /// Id rendered for log fields; unsaved notifications show "-".
    pub fn log_id(&self) -> String {
        self.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_builder() {
        let notification = NotificationBuilder::new("email", "ann@example.com")
            .subject("Welcome")
            .message("Hello")
            .metadata("source", "signup")
            .priority(5)
            .build();

        assert_eq!(notification.channel, "email");
        assert_eq!(notification.recipient, "ann@example.com");
        assert_eq!(notification.subject, "Welcome");
        assert_eq!(notification.status, NotificationStatus::Pending);
        assert_eq!(notification.metadata.get("source").map(String::as_str), Some("signup"));
        assert_eq!(notification.priority, 5);
        assert!(notification.id.is_none());
        assert_eq!(notification.log_id(), "-");
    }

    #[test]
    fn test_status_transitions() {
        use NotificationStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Pending));
        assert!(Sent.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("SENT".parse::<NotificationStatus>(), Ok(NotificationStatus::Sent));
        assert!("delivered".parse::<NotificationStatus>().is_err());
    }

    #[test]
    fn test_deserialize_minimal() {
        let notification: Notification = serde_json::from_value(serde_json::json!({
            "channel": "file",
            "recipient": "out.log"
        }))
        .unwrap();

        assert_eq!(notification.status, NotificationStatus::Pending);
        assert!(notification.subject.is_empty());
        assert!(notification.metadata.is_empty());
    }
}
