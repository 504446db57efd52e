//! Graceful shutdown handling for the notification service.
//!
//! Runs after the HTTP server has stopped accepting requests:
//! 1. Stops the worker pool, letting in-flight jobs finish
//! 2. Stops background tasks such as rate limiter cleanup
//! 3. Closes the store
//!
//! Jobs still pending stay `Queued` in the store and are picked up by the
//! next process start.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::queue::WorkerPool;
use crate::store::NotificationStore;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for in-flight jobs to finish
    pub worker_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(30),
        }
    }
}

/// Handles graceful shutdown of the notification service
pub struct GracefulShutdown {
    workers: Arc<WorkerPool>,
    store: Arc<dyn NotificationStore>,
    background: Vec<JoinHandle<()>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(workers: Arc<WorkerPool>, store: Arc<dyn NotificationStore>, config: ShutdownConfig) -> Self {
        Self {
            workers,
            store,
            background: Vec::new(),
            config,
        }
    }

    /// Register a background task to abort during shutdown.
    pub fn with_background_task(mut self, handle: JoinHandle<()>) -> Self {
        self.background.push(handle);
        self
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(pending_jobs = self.workers.queue().queue_size())
    )]
    pub async fn execute(self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping workers");
        result.workers_stopped = match self.workers.shutdown(self.config.worker_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Workers did not stop cleanly");
                false
            }
        };
        result.pending_jobs = self.workers.queue().queue_size();

        tracing::info!("Phase 2: Stopping background tasks");
        for handle in &self.background {
            handle.abort();
        }
        result.background_stopped = self.background.len();

        tracing::info!("Phase 3: Closing store");
        self.store.close().await;

        result.duration = start.elapsed();
        result.success = result.workers_stopped;

        tracing::info!(
            workers_stopped = result.workers_stopped,
            pending_jobs = result.pending_jobs,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every phase completed in time
    pub success: bool,
    /// Whether all workers stopped within the timeout
    pub workers_stopped: bool,
    /// Jobs left `Queued` for the next start
    pub pending_jobs: usize,
    /// Background tasks aborted
    pub background_stopped: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
