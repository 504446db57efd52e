use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::metrics::QueueMetrics;
use crate::store::NotificationStore;

use super::{Job, JobInfo, QueueError};

/// Heap entry: higher priority first, then submission order.
struct Pending {
    priority: i32,
    sequence: u64,
    job: Job,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Bounded, priority-aware FIFO of jobs waiting for a worker.
///
/// Jobs are written to the store as `Queued` before they become visible to
/// workers. The in-memory status map only tracks live jobs; finished jobs
/// are looked up in the store.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<Pending>>,
    notify: Notify,
    capacity: usize,
    pending: AtomicUsize,
    sequence: AtomicU64,
    closed: AtomicBool,
    live: DashMap<Uuid, JobInfo>,
    store: Arc<dyn NotificationStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn NotificationStore>, capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            pending: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            live: DashMap::new(),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Pending>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a new job and return its id without waiting for delivery.
    #[tracing::instrument(
        name = "queue.enqueue",
        skip(self, job),
        fields(job_id = %job.id, channel = %job.notification.channel)
    )]
    pub async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            QueueMetrics::record_rejected();
            return Err(QueueError::Closed);
        }

        // Reserve a slot before touching the store
        let capacity = self.capacity;
        if self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < capacity).then_some(n + 1))
            .is_err()
        {
            QueueMetrics::record_rejected();
            tracing::warn!(capacity, "Job queue full, rejecting job");
            return Err(QueueError::Full(capacity));
        }

        if let Err(e) = self.store.save_job(&job).await {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(e.into());
        }

        let id = job.id;
        self.push(job);
        tracing::debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Put an already persisted job back in line.
    ///
    /// Used for retries and crash recovery, so it ignores the capacity limit.
    pub(crate) fn requeue(&self, job: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.push(job);
    }

    fn push(&self, job: Job) {
        self.live.insert(job.id, JobInfo::from(&job));
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.lock().push(Pending {
            priority: job.priority,
            sequence,
            job,
        });
        QueueMetrics::record_enqueued(self.queue_size());
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Job> {
        let entry = self.lock().pop()?;
        let remaining = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        QueueMetrics::record_dequeued(remaining);
        Some(entry.job)
    }

    /// Wait for the next job, or `None` once shutdown is signalled.
    pub(crate) async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Job> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_pop() {
                return Some(job);
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Number of jobs waiting for a worker.
    pub fn queue_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting new jobs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record the latest state of a job; terminal jobs leave the live map.
    pub(crate) fn track(&self, job: &Job) {
        if job.status.is_terminal() {
            self.live.remove(&job.id);
        } else {
            self.live.insert(job.id, JobInfo::from(job));
        }
    }

    /// Current view of a job, from memory while it is live, else from the store.
    pub async fn job_status(&self, id: Uuid) -> Result<Option<JobInfo>, QueueError> {
        if let Some(info) = self.live.get(&id) {
            return Ok(Some(info.clone()));
        }
        let job = self.store.get_job(id).await?;
        Ok(job.as_ref().map(JobInfo::from))
    }
}
