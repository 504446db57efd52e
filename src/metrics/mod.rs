//! Prometheus metrics for the notification service.
//!
//! - Dispatch metrics (per channel outcome and latency)
//! - Queue and worker metrics
//! - Template rendering metrics
//! - Store and rate limiting metrics

mod helpers;

pub use helpers::{
    encode_metrics, DispatchMetrics, QueueMetrics, RateLimitMetrics, StoreMetrics,
    TemplateMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "notify";

lazy_static! {
    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Delivery attempts by channel and outcome
    pub static ref NOTIFICATIONS_DISPATCHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_dispatched_total", METRIC_PREFIX),
        "Total delivery attempts by channel and outcome",
        &["channel", "outcome"]
    ).unwrap();

    /// Delivery latency per channel
    pub static ref DISPATCH_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_dispatch_latency_seconds", METRIC_PREFIX),
        "Channel delivery latency in seconds",
        &["channel"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Jobs currently waiting for a worker
    pub static ref QUEUE_PENDING: IntGauge = register_int_gauge!(
        format!("{}_queue_pending", METRIC_PREFIX),
        "Jobs currently waiting for a worker"
    ).unwrap();

    /// Jobs accepted by the queue
    pub static ref JOBS_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_enqueued_total", METRIC_PREFIX),
        "Total jobs enqueued"
    ).unwrap();

    /// Jobs that reached a terminal state
    pub static ref JOBS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_finished_total", METRIC_PREFIX),
        "Total jobs finished by terminal status",
        &["status"]
    ).unwrap();

    /// Jobs scheduled for another attempt
    pub static ref JOBS_RETRIED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_retried_total", METRIC_PREFIX),
        "Total job retries scheduled"
    ).unwrap();

    /// Jobs rejected because the queue was full
    pub static ref JOBS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_rejected_total", METRIC_PREFIX),
        "Total jobs rejected because the queue was full"
    ).unwrap();

    /// Jobs whose processing panicked
    pub static ref JOBS_PANICKED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_panicked_total", METRIC_PREFIX),
        "Total jobs whose processing task panicked"
    ).unwrap();

    /// Workers currently processing a job
    pub static ref WORKERS_BUSY: IntGauge = register_int_gauge!(
        format!("{}_workers_busy", METRIC_PREFIX),
        "Workers currently processing a job"
    ).unwrap();

    // ============================================================================
    // Template Metrics
    // ============================================================================

    /// Template renders by mode and outcome
    pub static ref TEMPLATE_RENDERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_template_renders_total", METRIC_PREFIX),
        "Total template renders by mode and outcome",
        &["mode", "outcome"]
    ).unwrap();

    /// Parsed templates held in the cache
    pub static ref TEMPLATE_CACHE_SIZE: IntGauge = register_int_gauge!(
        format!("{}_template_cache_size", METRIC_PREFIX),
        "Number of parsed templates in the cache"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    /// Store operation latency
    pub static ref STORE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_operation_latency_seconds", METRIC_PREFIX),
        "Store operation latency in seconds",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Store operation errors
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Total store operation errors",
        &["backend", "operation"]
    ).unwrap();

    // ============================================================================
    // Rate Limiting Metrics
    // ============================================================================

    /// Requests allowed by rate limiter
    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total requests allowed by rate limiter"
    ).unwrap();

    /// Requests denied by rate limiter
    pub static ref RATELIMIT_DENIED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Total requests denied by rate limiter"
    ).unwrap();

    /// Live token buckets
    pub static ref RATELIMIT_BUCKETS: IntGauge = register_int_gauge!(
        format!("{}_ratelimit_buckets", METRIC_PREFIX),
        "Number of live rate limit buckets"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        // lazy_static registers on first access
        JOBS_ENQUEUED_TOTAL.inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("notify_jobs_enqueued_total"));
    }

    #[test]
    fn test_dispatch_metrics() {
        DispatchMetrics::record("file", true, std::time::Duration::from_millis(3));
        DispatchMetrics::record("webhook", false, std::time::Duration::from_millis(30));
        assert!(
            NOTIFICATIONS_DISPATCHED_TOTAL
                .with_label_values(&["file", "success"])
                .get()
                >= 1
        );
    }
}
