//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    DISPATCH_LATENCY, JOBS_ENQUEUED_TOTAL, JOBS_FINISHED_TOTAL, JOBS_PANICKED_TOTAL,
    JOBS_REJECTED_TOTAL, JOBS_RETRIED_TOTAL, NOTIFICATIONS_DISPATCHED_TOTAL, QUEUE_PENDING,
    RATELIMIT_ALLOWED_TOTAL, RATELIMIT_BUCKETS, RATELIMIT_DENIED_TOTAL, STORE_ERRORS_TOTAL,
    STORE_OPERATION_LATENCY, TEMPLATE_CACHE_SIZE, TEMPLATE_RENDERS_TOTAL, WORKERS_BUSY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Helper struct for recording dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record one delivery attempt on a channel
    pub fn record(channel: &str, success: bool, elapsed: Duration) {
        NOTIFICATIONS_DISPATCHED_TOTAL
            .with_label_values(&[channel, outcome(success)])
            .inc();
        DISPATCH_LATENCY
            .with_label_values(&[channel])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a notification naming no registered channel
    pub fn record_unknown_channel() {
        NOTIFICATIONS_DISPATCHED_TOTAL
            .with_label_values(&["unknown", "failure"])
            .inc();
    }
}

/// Helper struct for recording queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued(pending: usize) {
        JOBS_ENQUEUED_TOTAL.inc();
        QUEUE_PENDING.set(pending as i64);
    }

    pub fn record_dequeued(pending: usize) {
        QUEUE_PENDING.set(pending as i64);
    }

    pub fn record_rejected() {
        JOBS_REJECTED_TOTAL.inc();
    }

    pub fn record_done() {
        JOBS_FINISHED_TOTAL.with_label_values(&["done"]).inc();
    }

    pub fn record_failed() {
        JOBS_FINISHED_TOTAL.with_label_values(&["failed"]).inc();
    }

    pub fn record_retry() {
        JOBS_RETRIED_TOTAL.inc();
    }

    pub fn record_panic() {
        JOBS_PANICKED_TOTAL.inc();
    }

    pub fn worker_busy() {
        WORKERS_BUSY.inc();
    }

    pub fn worker_idle() {
        WORKERS_BUSY.dec();
    }
}

/// Helper struct for recording template metrics
pub struct TemplateMetrics;

impl TemplateMetrics {
    /// `escaped` distinguishes the HTML-safe path from the plain text one
    pub fn record_render(escaped: bool, success: bool) {
        let mode = if escaped { "html" } else { "text" };
        TEMPLATE_RENDERS_TOTAL
            .with_label_values(&[mode, outcome(success)])
            .inc();
    }

    pub fn set_cache_size(size: usize) {
        TEMPLATE_CACHE_SIZE.set(size as i64);
    }
}

/// Helper struct for recording store metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_operation(backend: &str, operation: &str, elapsed: Duration, success: bool) {
        STORE_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(elapsed.as_secs_f64());
        if !success {
            STORE_ERRORS_TOTAL
                .with_label_values(&[backend, operation])
                .inc();
        }
    }
}

/// Helper struct for recording rate limit metrics
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed() {
        RATELIMIT_ALLOWED_TOTAL.inc();
    }

    pub fn record_denied() {
        RATELIMIT_DENIED_TOTAL.inc();
    }

    pub fn set_buckets(count: usize) {
        RATELIMIT_BUCKETS.set(count as i64);
    }
}
