use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::Serialize;
use serde_json::json;

use crate::notification::Notification;

use super::{read_snippet, ChannelError, ChannelKind, DispatchResult};

/// Metadata key prefix for extra request headers
const HEADER_PREFIX: &str = "header_";

/// Response of an ad-hoc request made with [`WebhookChannel::send_to_url`].
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Delivers notifications as JSON over HTTP to the recipient URL.
pub struct WebhookChannel {
    client: reqwest::Client,
    timeout_seconds: u64,
}

impl WebhookChannel {
    /// `client` must already carry the request timeout.
    pub fn new(client: reqwest::Client, timeout_seconds: u64) -> Self {
        Self {
            client,
            timeout_seconds,
        }
    }

    #[tracing::instrument(
        name = "channel.webhook",
        skip(self, notification),
        fields(notification_id = %notification.log_id(), url = %notification.recipient)
    )]
    pub async fn send(&self, notification: &Notification) -> Result<DispatchResult, ChannelError> {
        let url = parse_http_url(&notification.recipient)
            .map_err(ChannelError::InvalidRecipient)?;

        let method = match notification.metadata.get("method") {
            Some(m) => parse_method(m)?,
            None => Method::POST,
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &notification.metadata {
            if let Some(name) = key.strip_prefix(HEADER_PREFIX) {
                let (name, value) = parse_header(name, value)?;
                headers.insert(name, value);
            }
        }

        let payload = json!({
            "subject": notification.subject,
            "message": notification.message,
            "metadata": notification.metadata,
            "timestamp": Utc::now().timestamp(),
        });

        let response = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = read_snippet(response).await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "Webhook endpoint rejected notification");
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(DispatchResult::ok(
            ChannelKind::Webhook,
            json!({
                "status_code": status.as_u16(),
                "response": body,
                "url": url.as_str(),
            }),
        ))
    }

    /// Issue a single request to an arbitrary http(s) URL.
    ///
    /// Unlike [`send`](Self::send) this reports any HTTP status back to the
    /// caller and only fails when no response was received.
    #[tracing::instrument(name = "channel.webhook.send_to_url", skip(self, headers, body))]
    pub async fn send_to_url(
        &self,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: String,
    ) -> Result<WebhookResponse, ChannelError> {
        let target = parse_http_url(url).map_err(ChannelError::InvalidRequest)?;
        let method = if method.is_empty() {
            Method::POST
        } else {
            parse_method(method)?
        };

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let (name, value) = parse_header(key, value)?;
            header_map.insert(name, value);
        }

        let response = self
            .client
            .request(method.clone(), target.clone())
            .headers(header_map)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status_code = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = read_snippet(response).await.map_err(|e| self.classify(e))?;

        Ok(WebhookResponse {
            url: target.to_string(),
            method: method.to_string(),
            status_code,
            headers: response_headers,
            body,
        })
    }

    fn classify(&self, e: reqwest::Error) -> ChannelError {
        if e.is_timeout() {
            ChannelError::Timeout(self.timeout_seconds)
        } else if e.is_connect() {
            ChannelError::Transport(format!("connection failed: {e}"))
        } else {
            ChannelError::Transport(e.to_string())
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    if raw.is_empty() {
        return Err("webhook URL is required".to_string());
    }
    let url = Url::parse(raw).map_err(|e| format!("'{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme '{}'", other)),
    }
}

fn parse_method(raw: &str) -> Result<Method, ChannelError> {
    let method = Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| ChannelError::InvalidRequest(format!("invalid HTTP method '{}'", raw)))?;
    match method {
        Method::GET | Method::POST | Method::PUT | Method::PATCH | Method::DELETE => Ok(method),
        other => Err(ChannelError::InvalidRequest(format!(
            "HTTP method '{}' not allowed",
            other
        ))),
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ChannelError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ChannelError::InvalidRequest(format!("invalid header name '{}'", name)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| ChannelError::InvalidRequest(format!("invalid value for header '{}'", name)))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel() -> WebhookChannel {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        WebhookChannel::new(client, 2)
    }

    #[tokio::test]
    async fn test_send_posts_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-signature", "abc"))
            .and(body_partial_json(json!({"subject": "Deploy", "message": "done"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let notification = Notification::builder("webhook", format!("{}/hook", server.uri()))
            .subject("Deploy")
            .message("done")
            .metadata("header_X-Signature", "abc")
            .build();

        let result = channel().send(&notification).await.unwrap();

        assert!(result.success);
        assert_eq!(result.response["status_code"], 200);
        assert_eq!(result.response["response"], "ok");
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let notification = Notification::builder("webhook", server.uri()).build();
        let err = channel().send(&notification).await.unwrap_err();

        match err {
            ChannelError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_response_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64 * 1024)))
            .mount(&server)
            .await;

        let notification = Notification::builder("webhook", server.uri()).build();
        let result = channel().send(&notification).await.unwrap();

        let body = result.response["response"].as_str().unwrap();
        assert_eq!(body.len(), crate::channels::MAX_RESPONSE_SNIPPET);
    }

    #[tokio::test]
    async fn test_stalled_body_is_timeout() {
        use tokio::io::AsyncWriteExt;

        // Headers arrive, the promised body never does
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let notification = Notification::builder("webhook", format!("http://{}/slow", addr)).build();
        let err = WebhookChannel::new(client, 1).send(&notification).await.unwrap_err();

        assert!(matches!(err, ChannelError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_rejects_non_http_recipient() {
        let notification = Notification::builder("webhook", "file:///etc/passwd").build();
        let err = channel().send(&notification).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidRecipient(_)));

        let notification = Notification::builder("webhook", "").build();
        let err = channel().send(&notification).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidRecipient(_)));
    }

    #[tokio::test]
    async fn test_send_to_url_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/test"))
            .and(header("x-token", "t"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("X-Token".to_string(), "t".to_string());

        let response = channel()
            .send_to_url(&format!("{}/test", server.uri()), "put", &headers, "{}".to_string())
            .await
            .unwrap();

        assert_eq!(response.status_code, 404);
        assert_eq!(response.method, "PUT");
        assert_eq!(response.body, "missing");
    }

    #[tokio::test]
    async fn test_send_to_url_connection_failure() {
        // Nothing listens on port 9 locally
        let err = channel()
            .send_to_url("http://127.0.0.1:9/", "POST", &HashMap::new(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_) | ChannelError::Timeout(_)));
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert!(parse_method("CONNECT").is_err());
        assert!(parse_method("bad method").is_err());
    }
}
