//! In-memory store backend.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::notification::{Notification, NotificationStatus};
use crate::queue::{Job, JobStatus};

use super::{ListFilter, NotificationStore, OrderField, StoreError, StoreHealth};

/// Process-local store using DashMap.
///
/// Ids are assigned from an atomic counter starting at 1.
pub struct MemoryStore {
    notifications: DashMap<i64, Notification>,
    jobs: DashMap<Uuid, Job>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            notifications: DashMap::new(),
            jobs: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(a: &Notification, b: &Notification, field: OrderField) -> CmpOrdering {
    let primary = match field {
        OrderField::Id => a.id.cmp(&b.id),
        OrderField::CreatedAt => a.created_at.cmp(&b.created_at),
        OrderField::SentAt => a.sent_at.cmp(&b.sent_at),
        OrderField::Channel => a.channel.cmp(&b.channel),
        OrderField::Status => a.status.as_str().cmp(b.status.as_str()),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn save_notification(&self, notification: &Notification) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut record = notification.clone();
        record.id = Some(id);
        self.notifications.insert(id, record);
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut record = self
            .notifications
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;

        if !record.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        record.error = error.map(str::to_string);
        if status == NotificationStatus::Sent {
            record.sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_notification(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        Ok(self.notifications.get(&id).map(|n| n.clone()))
    }

    async fn list_notifications(&self, filter: &ListFilter) -> Result<Vec<Notification>, StoreError> {
        let mut matched: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        matched.sort_by(|a, b| {
            let ordering = compare(a, b, filter.order_by);
            if filter.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        matched.truncate(filter.effective_limit());
        Ok(matched)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Notification>, StoreError> {
        let needle = query.to_lowercase();
        let mut matched: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|entry| {
                let n = entry.value();
                n.subject.to_lowercase().contains(&needle)
                    || n.message.to_lowercase().contains(&needle)
            })
            .map(|entry| entry.value().clone())
            .collect();

        matched.sort_by(|a, b| compare(b, a, OrderField::CreatedAt));
        matched.truncate(limit.clamp(1, super::MAX_LIST_LIMIT));
        Ok(matched)
    }

    async fn ping(&self) -> StoreHealth {
        StoreHealth::ok("memory")
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut stored = self.jobs.get_mut(&job.id).ok_or(StoreError::JobNotFound(job.id))?;
        *stored = job.clone();
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| matches!(entry.status, JobStatus::Queued | JobStatus::InProgress))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(channel: &str, subject: &str) -> Notification {
        Notification::builder(channel, "ann@example.com")
            .subject(subject)
            .message("body text")
            .build()
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let store = MemoryStore::new();

        let a = store.save_notification(&notification("email", "a")).await.unwrap();
        let b = store.save_notification(&notification("email", "b")).await.unwrap();

        assert!(b > a);
        let saved = store.get_notification(a).await.unwrap().unwrap();
        assert_eq!(saved.id, Some(a));
        assert_eq!(saved.status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_transitions_are_guarded() {
        let store = MemoryStore::new();
        let id = store.save_notification(&notification("email", "a")).await.unwrap();

        store.update_status(id, NotificationStatus::Sent, None).await.unwrap();
        let err = store
            .update_status(id, NotificationStatus::Failed, Some("late"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let saved = store.get_notification(id).await.unwrap().unwrap();
        assert_eq!(saved.status, NotificationStatus::Sent);
        assert!(saved.sent_at.is_some());

        assert!(matches!(
            store.update_status(999, NotificationStatus::Sent, None).await,
            Err(StoreError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = MemoryStore::new();
        for (channel, subject) in [("email", "a"), ("file", "b"), ("email", "c")] {
            store.save_notification(&notification(channel, subject)).await.unwrap();
        }

        let filter = ListFilter {
            channel: Some("email".into()),
            order_by: OrderField::Id,
            descending: false,
            ..Default::default()
        };
        let listed = store.list_notifications(&filter).await.unwrap();

        let subjects: Vec<_> = listed.iter().map(|n| n.subject.as_str()).collect();
        assert_eq!(subjects, vec!["a", "c"]);

        let filter = ListFilter {
            limit: 1,
            order_by: OrderField::Id,
            ..Default::default()
        };
        let listed = store.list_notifications(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject, "c");
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let store = MemoryStore::new();
        store.save_notification(&notification("email", "Server DOWN")).await.unwrap();
        store.save_notification(&notification("email", "weekly report")).await.unwrap();

        let found = store.search("down", 100).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].subject, "Server DOWN");
    }

    #[tokio::test]
    async fn test_unfinished_jobs() {
        let store = MemoryStore::new();
        let mut done = Job::new(notification("email", "a"), 1);
        let queued = Job::new(notification("email", "b"), 1);
        let mut running = Job::new(notification("email", "c"), 1);
        store.save_job(&done).await.unwrap();
        store.save_job(&queued).await.unwrap();
        store.save_job(&running).await.unwrap();

        done.set_status(JobStatus::Done, None);
        running.set_status(JobStatus::InProgress, None);
        store.update_job(&done).await.unwrap();
        store.update_job(&running).await.unwrap();

        let unfinished = store.load_unfinished_jobs().await.unwrap();
        assert_eq!(unfinished.len(), 2);
        assert!(unfinished.iter().any(|j| j.id == queued.id));
        assert!(unfinished.iter().any(|j| j.id == running.id && j.status == JobStatus::InProgress));
    }
}
