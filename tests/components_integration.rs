//! Cross-component integration tests
//!
//! These tests drive the queue, worker pool, channels, templates and HTTP
//! router together against an in-memory store. Outbound HTTP goes to a
//! local wiremock server and mail is captured by a recording transport, so
//! no external services are needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::Message;
use tokio::sync::Mutex;
use uuid::Uuid;

use notify_dispatch_service::channels::{
    Channel, ChannelError, EmailChannel, FileChannel, MailTransport, WebhookChannel,
};
use notify_dispatch_service::config::{QueueConfig, Settings};
use notify_dispatch_service::notification::{Notification, NotificationDispatcher};
use notify_dispatch_service::queue::{Job, JobStatus, WorkerPool};
use notify_dispatch_service::store::{MemoryStore, NotificationStore};
use notify_dispatch_service::template::Renderer;

/// Captures outgoing mail instead of talking to a relay.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(&self, message: Message) -> Result<(), ChannelError> {
        self.sent.lock().await.push(message);
        Ok(())
    }
}

struct TestEnvironment {
    dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    renderer: Arc<Renderer>,
    dispatcher: Arc<NotificationDispatcher>,
    mail: Arc<RecordingTransport>,
}

/// Create a test environment with every channel except Slack
fn create_test_environment() -> TestEnvironment {
    let dir = tempfile::tempdir().unwrap();
    let templates = dir.path().join("templates");
    std::fs::create_dir_all(templates.join("email")).unwrap();
    std::fs::write(
        templates.join("email/welcome.html"),
        "<p>Welcome {{.name}}</p>",
    )
    .unwrap();
    std::fs::write(templates.join("alert.txt"), "{{upper .level}}: {{.text}}").unwrap();

    let mail = Arc::new(RecordingTransport::default());
    let email = EmailChannel::new("noreply@example.com", mail.clone());
    let webhook = WebhookChannel::new(reqwest::Client::new(), 5);
    let file = FileChannel::new(dir.path().join("logs").to_str().unwrap()).unwrap();

    let dispatcher = NotificationDispatcher::new([
        Channel::from(email),
        Channel::from(webhook),
        Channel::from(file),
    ]);

    TestEnvironment {
        store: Arc::new(MemoryStore::new()),
        renderer: Arc::new(Renderer::with_root(&templates, true).unwrap()),
        dispatcher: Arc::new(dispatcher),
        mail,
        dir,
    }
}

fn queue_config(workers: usize) -> QueueConfig {
    QueueConfig {
        workers,
        capacity: 1000,
        max_attempts: 1,
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
        shutdown_timeout_seconds: 5,
    }
}

fn create_pool(env: &TestEnvironment, workers: usize) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(
        &queue_config(workers),
        env.store.clone(),
        env.dispatcher.clone(),
        env.renderer.clone(),
    ))
}

async fn wait_terminal(store: &MemoryStore, id: Uuid) -> Job {
    for _ in 0..500 {
        if let Some(job) = store.get_job(id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not reach a terminal state", id);
}

// =============================================================================
// Worker Pool Integration Tests
// =============================================================================

mod worker_pool_tests {
    use super::*;
    use notify_dispatch_service::notification::NotificationStatus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_mixed_batch_reaches_terminal_states() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let env = create_test_environment();
        let pool = create_pool(&env, 3);
        pool.start().await.unwrap();

        let email = Job::new(
            Notification::builder("email", "ann@example.com")
                .subject("Welcome")
                .build(),
            1,
        )
        .with_template("email/welcome.html", serde_json::json!({"name": "<Ann>"}));
        let webhook = Job::new(
            Notification::builder("webhook", format!("{}/hook", server.uri()))
                .subject("Deploy")
                .message("finished")
                .build(),
            1,
        );
        let unknown = Job::new(Notification::builder("pager", "ops").build(), 1);

        let mut ids = Vec::new();
        for job in [email, webhook, unknown] {
            ids.push(pool.queue().enqueue(job).await.unwrap());
        }
        assert_eq!(ids.len(), 3);

        let email = wait_terminal(&env.store, ids[0]).await;
        let webhook = wait_terminal(&env.store, ids[1]).await;
        let unknown = wait_terminal(&env.store, ids[2]).await;

        assert_eq!(email.status, JobStatus::Done);
        assert_eq!(email.notification.message, "<p>Welcome &lt;Ann&gt;</p>");
        assert_eq!(env.mail.sent.lock().await.len(), 1);

        assert_eq!(webhook.status, JobStatus::Done);

        assert_eq!(unknown.status, JobStatus::Failed);
        assert!(unknown.error.unwrap().contains("Unknown channel"));
        let record = env
            .store
            .get_notification(unknown.notification.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, NotificationStatus::Failed);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_producers_all_finish() {
        let env = create_test_environment();
        let pool = create_pool(&env, 4);
        pool.start().await.unwrap();

        let mut handles = Vec::new();
        for producer in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for n in 0..10 {
                    let job = Job::new(
                        Notification::builder("file", format!("producer-{}.log", producer))
                            .subject(format!("event {}", n))
                            .build(),
                        1,
                    );
                    ids.push(pool.queue().enqueue(job).await.unwrap());
                }
                ids
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 80);

        for id in ids {
            assert_eq!(wait_terminal(&env.store, id).await.status, JobStatus::Done);
        }
        assert_eq!(env.store.notification_count(), 80);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unfinished_jobs_recovered_on_start() {
        let env = create_test_environment();

        // A job left mid-flight by a previous process
        let mut job = Job::new(Notification::builder("file", "recovered.log").build(), 1);
        job.status = JobStatus::InProgress;
        job.attempts = 1;
        env.store.save_job(&job).await.unwrap();

        let pool = create_pool(&env, 1);
        let recovered = pool.start().await.unwrap();
        assert_eq!(recovered, 1);

        let finished = wait_terminal(&env.store, job.id).await;
        assert_eq!(finished.status, JobStatus::Done);
        assert!(env.dir.path().join("logs/recovered.log").exists());

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}

// =============================================================================
// Template Renderer Integration Tests
// =============================================================================

mod template_tests {
    use super::*;
    use notify_dispatch_service::template::TemplateError;

    #[tokio::test]
    async fn test_traversal_rejected() {
        let env = create_test_environment();
        std::fs::write(env.dir.path().join("secret.txt"), "top secret").unwrap();

        let result = env
            .renderer
            .render_text("../secret.txt", &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(TemplateError::PathEscape(_))));
    }

    #[tokio::test]
    async fn test_text_render_uses_helpers() {
        let env = create_test_environment();
        let out = env
            .renderer
            .render_text("alert.txt", &serde_json::json!({"level": "warn", "text": "disk <90%>"}))
            .await
            .unwrap();
        assert_eq!(out, "WARN: disk <90%>");
    }

    #[tokio::test]
    async fn test_template_listing() {
        let env = create_test_environment();
        let mut names = env.renderer.list_templates().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["alert.txt", "email/welcome.html"]);
    }
}

// =============================================================================
// HTTP API Integration Tests
// =============================================================================

mod http_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use notify_dispatch_service::server::{create_app, AppState};
    use serde_json::Value;
    use tower::ServiceExt;

    fn create_test_state(env: &TestEnvironment, api_key: Option<&str>) -> AppState {
        let mut settings = Settings::default();
        settings.api.key = api_key.map(str::to_string);
        settings.ratelimit.enabled = false;

        AppState::from_parts(
            settings,
            env.store.clone(),
            env.renderer.clone(),
            env.dispatcher.clone(),
        )
    }

    fn create_test_app(env: &TestEnvironment, api_key: Option<&str>) -> Router {
        create_app(create_test_state(env, api_key))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_channels() {
        let env = create_test_environment();
        let app = create_test_app(&env, None);

        let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue_size"], 0);
        assert_eq!(body["channels"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_notify_file_channel() {
        let env = create_test_environment();
        let app = create_test_app(&env, None);

        let (status, body) = send(
            app,
            post_json(
                "/notify",
                r#"{"channel":"file","recipient":"http.log","subject":"Hello","message":"from http"}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        let id = body["id"].as_i64().unwrap();
        let stored = env.store.get_notification(id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Hello");

        let written = std::fs::read_to_string(env.dir.path().join("logs/http.log")).unwrap();
        assert!(written.contains("from http"));
    }

    #[tokio::test]
    async fn test_api_key_required() {
        let env = create_test_environment();

        let (status, body) = send(
            create_test_app(&env, Some("secret")),
            Request::get("/notifications").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, _) = send(
            create_test_app(&env, Some("secret")),
            Request::get("/notifications")
                .header("X-API-Key", "secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Health stays public
        let (status, _) = send(
            create_test_app(&env, Some("secret")),
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let env = create_test_environment();
        let (status, body) = send(create_test_app(&env, None), post_json("/notify", "{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let env = create_test_environment();

        let uri = format!("/jobs/{}", Uuid::new_v4());
        let (status, _) = send(
            create_test_app(&env, None),
            Request::get(uri.as_str()).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            create_test_app(&env, None),
            Request::get("/jobs/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_order_field() {
        let env = create_test_environment();
        let (status, _) = send(
            create_test_app(&env, None),
            Request::get("/notifications?order_by=password")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_template_notify_errors() {
        let env = create_test_environment();
        std::fs::write(env.dir.path().join("secret.txt"), "top secret").unwrap();

        let (status, body) = send(
            create_test_app(&env, None),
            post_json(
                "/notify/template",
                r#"{"template":"missing.txt","channel":"file","recipient":"t.log","data":{}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "TEMPLATE_NOT_FOUND");

        let (status, _) = send(
            create_test_app(&env, None),
            post_json(
                "/notify/template",
                r#"{"template":"../secret.txt","channel":"file","recipient":"t.log","data":{}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(env.store.notification_count(), 0);
    }

    #[tokio::test]
    async fn test_template_notify_renders_and_delivers() {
        let env = create_test_environment();

        let (status, body) = send(
            create_test_app(&env, None),
            post_json(
                "/notify/template",
                r#"{"template":"alert.txt","channel":"file","recipient":"alerts.log","subject":"Disk","data":{"level":"crit","text":"full"}}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let stored = env
            .store
            .get_notification(body["id"].as_i64().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.message, "CRIT: full");
    }

    #[tokio::test]
    async fn test_sync_batch_keeps_input_order() {
        let env = create_test_environment();

        let (status, body) = send(
            create_test_app(&env, None),
            post_json(
                "/notify/batch",
                r#"{"notifications":[
                    {"channel":"file","recipient":"first.log","subject":"one"},
                    {"channel":"pager","recipient":"ops","subject":"two"},
                    {"channel":"file","recipient":"third.log","subject":"three"}
                ]}"#,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"], 3);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["status"], "sent");
        assert_eq!(results[1]["status"], "failed");
        assert!(results[1]["error"].as_str().unwrap().contains("Unknown channel"));
        assert_eq!(results[2]["status"], "sent");

        let first = env.store.get_notification(results[0]["id"].as_i64().unwrap()).await.unwrap().unwrap();
        let third = env.store.get_notification(results[2]["id"].as_i64().unwrap()).await.unwrap().unwrap();
        assert_eq!(first.subject, "one");
        assert_eq!(third.subject, "three");
    }

    #[tokio::test]
    async fn test_async_batch_enqueues_in_order() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let env = create_test_environment();
        let state = create_test_state(&env, None);
        let workers = state.workers.clone();
        workers.start().await.unwrap();
        let app = create_app(state);

        let payload = serde_json::json!({
            "async": true,
            "notifications": [
                {"channel": "email", "recipient": "ann@example.com", "subject": "Hi", "message": "hello"},
                {"channel": "webhook", "recipient": format!("{}/hook", server.uri()), "subject": "Ping"},
                {"channel": "unknown-channel", "recipient": "nobody", "subject": "Lost"}
            ]
        });
        let (status, body) = send(app, post_json("/notify/batch", &payload.to_string())).await;

        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);

        let mut jobs = Vec::new();
        for result in results {
            assert_eq!(result["queued"], true);
            let id = Uuid::parse_str(result["job_id"].as_str().unwrap()).unwrap();
            jobs.push(wait_terminal(&env.store, id).await);
        }

        assert_eq!(jobs[0].notification.channel, "email");
        assert_eq!(jobs[0].status, JobStatus::Done);
        assert_eq!(jobs[1].notification.channel, "webhook");
        assert_eq!(jobs[1].status, JobStatus::Done);
        assert_eq!(jobs[2].notification.channel, "unknown-channel");
        assert_eq!(jobs[2].status, JobStatus::Failed);
        assert!(jobs[2].error.as_deref().unwrap().contains("Unknown channel"));

        workers.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
