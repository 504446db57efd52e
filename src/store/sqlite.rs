//! SQLite store backend.
//!
//! Notifications live in a `notifications` table; queued jobs are kept as
//! JSON documents in a `jobs` table with their status duplicated into a
//! column for recovery queries.

use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::metrics::StoreMetrics;
use crate::notification::{Notification, NotificationStatus};
use crate::queue::{Job, JobStatus};

use super::{with_timeout, ListFilter, NotificationStore, StoreError, StoreHealth, MAX_LIST_LIMIT};

const BACKEND: &str = "sqlite";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        error TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        priority INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        sent_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_channel ON notifications(channel)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_created_at ON notifications(created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
];

/// SQLite-backed notification store.
pub struct SqliteStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let timeout = config.timeout();
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;

        let store = Self { pool, timeout };
        store.migrate().await?;

        tracing::info!(
            path = %config.path,
            pool_size = config.pool_size,
            "SQLite connection pool created"
        );
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let result = with_timeout(self.timeout, fut).await;
        StoreMetrics::record_operation(BACKEND, operation, started.elapsed(), result.is_ok());
        if let Err(e @ (StoreError::Database(_) | StoreError::Timeout(_))) = &result {
            tracing::warn!(operation, error = %e, "SQLite store operation failed");
        }
        result
    }
}

fn parse_notification(row: &SqliteRow) -> Result<Notification, StoreError> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(Notification {
        id: Some(row.try_get("id")?),
        channel: row.try_get("channel")?,
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        message: row.try_get("message")?,
        status: NotificationStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        error: row.try_get("error")?,
        metadata: serde_json::from_str(&metadata)?,
        priority: row.try_get("priority")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        sent_at: row.try_get::<Option<DateTime<Utc>>, _>("sent_at")?,
    })
}

fn parse_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let data: String = row.try_get("data")?;
    Ok(serde_json::from_str(&data)?)
}

/// Escape LIKE wildcards so the query is matched literally.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn save_notification(&self, notification: &Notification) -> Result<i64, StoreError> {
        self.run("save_notification", async {
            let metadata = serde_json::to_string(&notification.metadata)?;
            let result = sqlx::query(
                r#"
                INSERT INTO notifications
                    (channel, recipient, subject, message, status, error, metadata, priority, created_at, sent_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&notification.channel)
            .bind(&notification.recipient)
            .bind(&notification.subject)
            .bind(&notification.message)
            .bind(notification.status.as_str())
            .bind(&notification.error)
            .bind(metadata)
            .bind(notification.priority)
            .bind(notification.created_at)
            .bind(notification.sent_at)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.run("update_status", async {
            let sent_at = (status == NotificationStatus::Sent).then(Utc::now);
            let result = if NotificationStatus::Pending.can_transition_to(status) {
                sqlx::query(
                    "UPDATE notifications SET status = ?, error = ?, sent_at = ? WHERE id = ? AND status = 'pending'",
                )
                .bind(status.as_str())
                .bind(error)
                .bind(sent_at)
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            } else {
                0
            };

            if result == 1 {
                return Ok(());
            }

            let current: Option<String> = sqlx::query_scalar("SELECT status FROM notifications WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            match current {
                None => Err(StoreError::NotFound(id)),
                Some(current) => Err(StoreError::InvalidTransition {
                    id,
                    from: NotificationStatus::from_str(&current).map_err(StoreError::Corrupt)?,
                    to: status,
                }),
            }
        })
        .await
    }

    async fn get_notification(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        self.run("get_notification", async {
            let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(parse_notification).transpose()
        })
        .await
    }

    async fn list_notifications(&self, filter: &ListFilter) -> Result<Vec<Notification>, StoreError> {
        self.run("list_notifications", async {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM notifications WHERE 1 = 1");
            if let Some(channel) = &filter.channel {
                query.push(" AND channel = ").push_bind(channel);
            }
            if let Some(status) = filter.status {
                query.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(recipient) = &filter.recipient {
                query.push(" AND recipient = ").push_bind(recipient);
            }

            // Column names come from a closed enum, never from input
            let direction = if filter.descending { "DESC" } else { "ASC" };
            query
                .push(format_args!(
                    " ORDER BY {} {}, id {} LIMIT ",
                    filter.order_by.as_str(),
                    direction,
                    direction
                ))
                .push_bind(filter.effective_limit() as i64);

            let rows = query.build().fetch_all(&self.pool).await?;
            rows.iter().map(parse_notification).collect()
        })
        .await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.run("search", async {
            let pattern = like_pattern(query);
            let rows = sqlx::query(
                r#"
                SELECT * FROM notifications
                WHERE lower(subject) LIKE ?1 ESCAPE '\' OR lower(message) LIKE ?1 ESCAPE '\'
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
                "#,
            )
            .bind(pattern)
            .bind(limit.clamp(1, MAX_LIST_LIMIT) as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(parse_notification).collect()
        })
        .await
    }

    async fn ping(&self) -> StoreHealth {
        let check = self.run("ping", async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        });
        match check.await {
            Ok(()) => StoreHealth::ok(BACKEND),
            Err(e) => StoreHealth::failed(BACKEND, e.to_string()),
        }
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.run("save_job", async {
            let data = serde_json::to_string(job)?;
            sqlx::query("INSERT INTO jobs (id, status, data, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
                .bind(job.id.to_string())
                .bind(job.status.as_str())
                .bind(data)
                .bind(job.created_at)
                .bind(job.updated_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        self.run("update_job", async {
            let data = serde_json::to_string(job)?;
            let affected = sqlx::query("UPDATE jobs SET status = ?, data = ?, updated_at = ? WHERE id = ?")
                .bind(job.status.as_str())
                .bind(data)
                .bind(job.updated_at)
                .bind(job.id.to_string())
                .execute(&self.pool)
                .await?
                .rows_affected();
            if affected == 0 {
                return Err(StoreError::JobNotFound(job.id));
            }
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.run("get_job", async {
            let row = sqlx::query("SELECT data FROM jobs WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(parse_job).transpose()
        })
        .await
    }

    async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.run("load_unfinished_jobs", async {
            let rows = sqlx::query("SELECT data FROM jobs WHERE status IN (?, ?) ORDER BY created_at ASC")
                .bind(JobStatus::Queued.as_str())
                .bind(JobStatus::InProgress.as_str())
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(parse_job).collect()
        })
        .await
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("SQLite connection pool closed");
    }
}
