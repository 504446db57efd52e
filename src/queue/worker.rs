//! Worker pool draining the job queue.
//!
//! Each worker takes one job at a time and runs it in its own spawned task,
//! so a panic while processing surfaces as a `JoinError` and only that job
//! is failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::channels::ChannelKind;
use crate::config::QueueConfig;
use crate::metrics::QueueMetrics;
use crate::notification::{DispatchError, NotificationDispatcher, NotificationStatus};
use crate::store::{NotificationStore, StoreError};
use crate::template::Renderer;

use super::{BackoffConfig, Job, JobQueue, JobStatus, QueueError, RetryBackoff};

/// Everything a worker needs to carry a job to a terminal state.
struct JobProcessor {
    queue: Arc<JobQueue>,
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<NotificationDispatcher>,
    renderer: Arc<Renderer>,
    backoff: RetryBackoff,
    shutdown: watch::Receiver<bool>,
}

impl JobProcessor {
    /// Persist and publish the job's current state.
    async fn save_progress(&self, job: &Job) -> Result<(), StoreError> {
        self.store.update_job(job).await?;
        self.queue.track(job);
        Ok(())
    }

    #[tracing::instrument(
        name = "worker.process",
        skip(self, job),
        fields(job_id = %job.id, channel = %job.notification.channel, attempt = job.attempts + 1)
    )]
    async fn process(&self, mut job: Job) -> Result<(), StoreError> {
        job.attempts += 1;
        job.set_status(JobStatus::InProgress, None);
        self.save_progress(&job).await?;

        let rendered = match &job.template {
            Some(name) => Some(self.render(name, &job).await),
            None => None,
        };
        if let Some(Ok(message)) = &rendered {
            job.notification.message = message.clone();
        }

        let notification_id = match job.notification.id {
            Some(id) => id,
            None => {
                let id = self.store.save_notification(&job.notification).await?;
                job.notification.id = Some(id);
                self.save_progress(&job).await?;
                id
            }
        };

        if let Some(Err(e)) = rendered {
            tracing::warn!(notification_id, error = %e, "Template render failed, job will not be retried");
            return self.fail(job, notification_id, e.to_string()).await;
        }

        match self.dispatcher.dispatch(&job.notification).await {
            Ok(_) => {
                self.store
                    .update_status(notification_id, NotificationStatus::Sent, None)
                    .await?;
                job.set_status(JobStatus::Done, None);
                self.save_progress(&job).await?;
                QueueMetrics::record_done();
                tracing::info!(notification_id, attempts = job.attempts, "Job completed");
                Ok(())
            }
            Err(e) if e.is_retryable() && job.can_retry() => self.retry(job, e).await,
            Err(e) => self.fail(job, notification_id, e.to_string()).await,
        }
    }

    async fn render(&self, name: &str, job: &Job) -> Result<String, crate::template::TemplateError> {
        // HTML-bearing email gets the escaping path; plain-text channels do not
        if job.notification.channel == ChannelKind::Email.as_str() {
            self.renderer.render(name, &job.data).await
        } else {
            self.renderer.render_text(name, &job.data).await
        }
    }

    async fn fail(&self, mut job: Job, notification_id: i64, error: String) -> Result<(), StoreError> {
        self.store
            .update_status(notification_id, NotificationStatus::Failed, Some(&error))
            .await?;
        tracing::warn!(notification_id, error = %error, "Job failed");
        job.set_status(JobStatus::Failed, Some(error));
        self.save_progress(&job).await?;
        QueueMetrics::record_failed();
        Ok(())
    }

    async fn retry(&self, mut job: Job, error: DispatchError) -> Result<(), StoreError> {
        let delay = self.backoff.delay_for(job.attempts);
        tracing::warn!(
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery failed, scheduling retry"
        );

        job.set_status(JobStatus::Queued, Some(error.to_string()));
        self.save_progress(&job).await?;
        QueueMetrics::record_retry();

        let queue = self.queue.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.requeue(job),
                // Left Queued in the store; reloaded on next start
                _ = shutdown.changed() => {}
            }
        });
        Ok(())
    }

    /// Fail a job whose processing task panicked.
    async fn recover_panic(&self, fallback: Job, panic: String) {
        QueueMetrics::record_panic();
        tracing::error!(job_id = %fallback.id, error = %panic, "Job processing panicked");
        self.abandon(fallback, format!("job processing panicked: {}", panic)).await;
    }

    /// Fail a job that a store error cut short.
    async fn recover_store_error(&self, fallback: Job, error: StoreError) {
        tracing::error!(job_id = %fallback.id, error = %error, "Job aborted by store error");
        self.abandon(fallback, format!("store error: {}", error)).await;
    }

    /// Best-effort move of an interrupted job to `Failed`.
    ///
    /// The job always leaves the live map, even when the store write fails.
    async fn abandon(&self, fallback: Job, error: String) {
        let mut job = match self.store.get_job(fallback.id).await {
            Ok(Some(job)) => job,
            _ => fallback,
        };

        if let Some(id) = job.notification.id {
            match self
                .store
                .update_status(id, NotificationStatus::Failed, Some(&error))
                .await
            {
                Ok(()) | Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => tracing::error!(notification_id = id, error = %e, "Failed to record abandoned job"),
            }
        }

        job.set_status(JobStatus::Failed, Some(error));
        if let Err(e) = self.store.update_job(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist abandoned job");
        }
        self.queue.track(&job);
        QueueMetrics::record_failed();
    }
}

/// Fixed-size pool of workers draining a [`JobQueue`].
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    workers: usize,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: &QueueConfig,
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<NotificationDispatcher>,
        renderer: Arc<Renderer>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(store.clone(), config.capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = JobProcessor {
            queue: queue.clone(),
            store,
            dispatcher,
            renderer,
            backoff: RetryBackoff::new(BackoffConfig::from(config)),
            shutdown: shutdown_rx,
        };

        Self {
            queue,
            processor: Arc::new(processor),
            workers: config.workers.max(1),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Requeue unfinished jobs from the store, then spawn the workers.
    ///
    /// Jobs found `InProgress` were interrupted by a crash and go back to
    /// `Queued`. Returns the number of recovered jobs.
    pub async fn start(&self) -> Result<usize, QueueError> {
        let unfinished = self.processor.store.load_unfinished_jobs().await?;
        let recovered = unfinished.len();

        for mut job in unfinished {
            if job.status == JobStatus::InProgress {
                tracing::warn!(job_id = %job.id, attempts = job.attempts, "Requeueing interrupted job");
                job.set_status(JobStatus::Queued, job.error.clone());
                self.processor.store.update_job(&job).await?;
            }
            self.queue.requeue(job);
        }

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.workers {
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_worker(worker_id, queue, processor, shutdown)));
        }

        tracing::info!(workers = self.workers, recovered, "Worker pool started");
        Ok(recovered)
    }

    /// Stop taking jobs, let in-flight jobs finish, wait up to `timeout`.
    ///
    /// Jobs still pending stay `Queued` in the store.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        tracing::info!(
            pending = self.queue.queue_size(),
            timeout_seconds = timeout.as_secs(),
            "Initiating worker pool shutdown"
        );

        self.queue.close();
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(e) = handle.await {
                    tracing::error!(worker_id, error = %e, "Worker task ended abnormally");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                tracing::info!("Worker pool shutdown completed");
                Ok(())
            }
            Err(_) => {
                tracing::error!(
                    timeout_seconds = timeout.as_secs(),
                    "Worker shutdown timed out, in-flight jobs will be recovered on next start"
                );
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker_id, "Worker starting");

    while let Some(job) = queue.next(&mut shutdown).await {
        QueueMetrics::worker_busy();
        let fallback = job.clone();
        let task = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process(job).await })
        };

        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => processor.recover_store_error(fallback, e).await,
            Err(join_error) => processor.recover_panic(fallback, join_error.to_string()).await,
        }
        QueueMetrics::worker_idle();
    }

    tracing::debug!(worker_id, "Worker stopped");
}
