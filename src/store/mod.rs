//! Notification persistence.
//!
//! # Backend Architecture
//!
//! The store is an async trait with two implementations:
//!
//! - `SqliteStore`: durable storage in a SQLite file through sqlx (default)
//! - `MemoryStore`: process-local storage using DashMap, for tests and
//!   throwaway deployments
//!
//! Use `create_store()` to build the backend named by configuration. Every
//! call is failable and callers are expected to propagate errors.

mod memory;
mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::notification::{Notification, NotificationStatus};
use crate::queue::Job;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default page size for list and search
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Largest page a caller may request
pub const MAX_LIST_LIMIT: usize = 1000;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Notification not found: {0}")]
    NotFound(i64),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid status transition for notification {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Unsupported store backend '{0}', expected sqlite or memory")]
    UnsupportedBackend(String),
}

/// Column a notification listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderField {
    Id,
    #[default]
    CreatedAt,
    SentAt,
    Channel,
    Status,
}

impl OrderField {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderField::Id => "id",
            OrderField::CreatedAt => "created_at",
            OrderField::SentAt => "sent_at",
            OrderField::Channel => "channel",
            OrderField::Status => "status",
        }
    }
}

impl fmt::Display for OrderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(OrderField::Id),
            "created_at" => Ok(OrderField::CreatedAt),
            "sent_at" => Ok(OrderField::SentAt),
            "channel" => Ok(OrderField::Channel),
            "status" => Ok(OrderField::Status),
            other => Err(format!("unknown order field '{}'", other)),
        }
    }
}

/// Filters for listing notifications.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub channel: Option<String>,
    pub status: Option<NotificationStatus>,
    pub recipient: Option<String>,
    pub limit: usize,
    pub order_by: OrderField,
    pub descending: bool,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            channel: None,
            status: None,
            recipient: None,
            limit: DEFAULT_LIST_LIMIT,
            order_by: OrderField::default(),
            descending: true,
        }
    }
}

impl ListFilter {
    /// Limit clamped to `1..=MAX_LIST_LIMIT`
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }

    pub(crate) fn matches(&self, notification: &Notification) -> bool {
        self.channel.as_ref().is_none_or(|c| *c == notification.channel)
            && self.status.is_none_or(|s| s == notification.status)
            && self
                .recipient
                .as_ref()
                .is_none_or(|r| *r == notification.recipient)
    }
}

/// Result of a store health check.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub backend: &'static str,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn ok(backend: &'static str) -> Self {
        Self {
            backend,
            connected: true,
            error: None,
        }
    }

    pub fn failed(backend: &'static str, error: impl Into<String>) -> Self {
        Self {
            backend,
            connected: false,
            error: Some(error.into()),
        }
    }

    /// Short form reported by the health endpoint
    pub fn describe(&self) -> String {
        match &self.error {
            None => "ok".to_string(),
            Some(e) => format!("error: {}", e),
        }
    }
}

/// Durable notification and job records.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new notification and return its assigned id.
    async fn save_notification(&self, notification: &Notification) -> Result<i64, StoreError>;

    /// Move a pending notification to a terminal status.
    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_notification(&self, id: i64) -> Result<Option<Notification>, StoreError>;

    async fn list_notifications(&self, filter: &ListFilter) -> Result<Vec<Notification>, StoreError>;

    /// Case-insensitive match on subject or message, newest first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Notification>, StoreError>;

    async fn ping(&self) -> StoreHealth;

    /// Persist a newly queued job.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Overwrite the stored state of an existing job.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Jobs that are `Queued` or `InProgress`, oldest first.
    async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Release backend resources.
    async fn close(&self) {}
}

/// Create a store backend based on configuration.
///
/// - `"memory"`: returns a `MemoryStore`
/// - `"sqlite"` (default): opens `database.path` and creates the schema
///
/// Any other backend name is rejected.
pub async fn create_store(config: &DatabaseConfig) -> Result<Arc<dyn NotificationStore>, StoreError> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory notification store");
            Ok(Arc::new(MemoryStore::new()))
        }
        "sqlite" => {
            let store = SqliteStore::connect(config).await?;
            tracing::info!(backend = "sqlite", path = %config.path, "Creating SQLite notification store");
            Ok(Arc::new(store))
        }
        other => {
            tracing::error!(backend = %other, "Unknown store backend");
            Err(StoreError::UnsupportedBackend(other.to_string()))
        }
    }
}

/// Run a store future under the configured timeout.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
