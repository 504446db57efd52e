use serde_json::{json, Value};

use crate::notification::Notification;

use super::{read_snippet, ChannelError, ChannelKind, DispatchResult};

/// Posts notifications to the configured Slack incoming webhook.
///
/// The recipient field is ignored; every message goes to the one URL.
pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
    timeout_seconds: u64,
}

impl SlackChannel {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
            timeout_seconds,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    #[tracing::instrument(
        name = "channel.slack",
        skip(self, notification),
        fields(notification_id = %notification.log_id())
    )]
    pub async fn send(&self, notification: &Notification) -> Result<DispatchResult, ChannelError> {
        if !self.is_configured() {
            return Err(ChannelError::NotConfigured(
                "slack webhook URL is not set".to_string(),
            ));
        }

        let (payload, attachment) = build_payload(notification);

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout(self.timeout_seconds)
                } else {
                    ChannelError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = read_snippet(response)
                .await
                .unwrap_or_else(|e| format!("<body unreadable: {e}>"));
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(DispatchResult::ok(
            ChannelKind::Slack,
            json!({
                "status_code": status.as_u16(),
                "attachment": attachment,
            }),
        ))
    }
}

/// Message text plus an optional attachment when metadata carries
/// `color` or `footer`.
fn build_payload(notification: &Notification) -> (Value, bool) {
    let text = format!("*{}*\n{}", notification.subject, notification.message);
    let color = notification.metadata.get("color");
    let footer = notification.metadata.get("footer");

    if color.is_none() && footer.is_none() {
        return (json!({ "text": text }), false);
    }

    let payload = json!({
        "text": text,
        "attachments": [{
            "color": color.map(String::as_str).unwrap_or("good"),
            "title": notification.subject,
            "text": notification.message,
            "footer": footer.map(String::as_str).unwrap_or_default(),
        }],
    });
    (payload, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(url: String) -> SlackChannel {
        SlackChannel::new(reqwest::Client::new(), url, 5)
    }

    #[tokio::test]
    async fn test_unconfigured_channel_fails() {
        let notification = Notification::builder("slack", "").subject("s").build();
        let err = channel(String::new()).send(&notification).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_posts_text_to_configured_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/T000"))
            .and(body_json(json!({"text": "*Deploy*\nv1.2 is live"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        // Recipient is ignored in favour of the configured webhook
        let notification = Notification::builder("slack", "#ignored")
            .subject("Deploy")
            .message("v1.2 is live")
            .build();

        let result = channel(format!("{}/services/T000", server.uri()))
            .send(&notification)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.response["status_code"], 200);
        assert_eq!(result.response["attachment"], false);
    }

    #[tokio::test]
    async fn test_non_ok_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid_token"))
            .mount(&server)
            .await;

        let notification = Notification::builder("slack", "").subject("s").build();
        let err = channel(server.uri()).send(&notification).await.unwrap_err();

        assert!(matches!(err, ChannelError::Rejected { status: 403, .. }));
    }

    #[test]
    fn test_attachment_from_metadata() {
        let notification = Notification::builder("slack", "")
            .subject("Alert")
            .message("disk full")
            .metadata("color", "danger")
            .build();

        let (payload, attachment) = build_payload(&notification);

        assert!(attachment);
        assert_eq!(payload["attachments"][0]["color"], "danger");
        assert_eq!(payload["attachments"][0]["title"], "Alert");
        assert_eq!(payload["attachments"][0]["footer"], "");
    }
}
