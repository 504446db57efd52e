use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::metrics::RateLimitMetrics;

use super::TokenBucket;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    /// Caller should wait this many whole seconds
    Limited { retry_after_seconds: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Per-client token buckets.
///
/// The bucket map only grows with distinct active clients; idle buckets are
/// dropped by [`RateLimiter::cleanup_stale`].
pub struct RateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
    burst_size: u32,
    requests_per_second: u32,
    bucket_ttl: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            burst_size: config.burst_size.max(1),
            requests_per_second: config.requests_per_second.max(1),
            bucket_ttl: Duration::from_secs(config.bucket_ttl_seconds),
        }
    }

    /// Charge one request to `key`.
    pub fn check(&self, key: &str) -> RateLimitResult {
        let bucket = match self.buckets.get(key) {
            Some(bucket) => bucket.clone(),
            None => self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.burst_size, self.requests_per_second)))
                .clone(),
        };

        match bucket.try_acquire() {
            Ok(()) => {
                RateLimitMetrics::record_allowed();
                RateLimitResult::Allowed
            }
            Err(wait) => {
                RateLimitMetrics::record_denied();
                RateLimitResult::Limited {
                    retry_after_seconds: wait.as_secs_f64().ceil().max(1.0) as u64,
                }
            }
        }
    }

    /// Drop buckets idle for longer than the configured TTL.
    pub fn cleanup_stale(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for() < self.bucket_ttl);
        let remaining = self.buckets.len();
        RateLimitMetrics::set_buckets(remaining);
        before.saturating_sub(remaining)
    }

    /// Number of tracked clients
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Periodically evict stale buckets until the process exits.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup_stale();
                if removed > 0 {
                    tracing::debug!(removed, remaining = limiter.len(), "Evicted idle rate limit buckets");
                }
            }
        })
    }
}
