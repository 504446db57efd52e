//! Asynchronous delivery queue.
//!
//! Jobs move through `Queued -> InProgress -> {Done, Failed}`:
//!
//! - [`JobQueue`] holds pending jobs in priority order (FIFO within a
//!   priority) and persists every job before a worker can see it
//! - [`WorkerPool`] runs a fixed number of workers that render, dispatch and
//!   record each job
//! - [`RetryBackoff`] spaces out retries when `max_attempts > 1`
//!
//! On shutdown, pending jobs stay `Queued` in the store and are reloaded by
//! the next [`WorkerPool::start`].

mod backoff;
mod job;
mod pending;
mod worker;

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

pub use backoff::{BackoffConfig, RetryBackoff};
pub use job::{Job, JobInfo, JobStatus};
pub use pending::JobQueue;
pub use worker::WorkerPool;

/// Errors that can occur when submitting or tracking jobs.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is full ({0} pending jobs)")]
    Full(usize),

    #[error("Queue is shutting down")]
    Closed,

    #[error("Worker shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}
