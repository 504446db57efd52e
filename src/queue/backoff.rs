//! Exponential backoff for job retries

use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&QueueConfig> for BackoffConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            initial_delay_ms: config.backoff_initial_ms,
            max_delay_ms: config.backoff_max_ms.max(config.backoff_initial_ms),
            ..Self::default()
        }
    }
}

/// Retry delay calculator.
///
/// Stateless: the delay is derived from the number of attempts a job has
/// already made, so it survives requeue and process restarts.
#[derive(Debug, Clone, Default)]
pub struct RetryBackoff {
    config: BackoffConfig,
}

impl RetryBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_delay = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let final_delay = if self.config.jitter_factor > 0.0 && capped_delay > 0.0 {
            let jitter_range = capped_delay * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).clamp(1.0, self.config.max_delay_ms.max(1) as f64) as u64
        } else {
            capped_delay.max(1.0) as u64
        };

        Duration::from_millis(final_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: u64, max: u64, multiplier: f64) -> RetryBackoff {
        RetryBackoff::new(BackoffConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_backoff_increases() {
        let backoff = no_jitter(100, 10_000, 2.0);

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let backoff = no_jitter(1_000, 5_000, 10.0);

        assert_eq!(backoff.delay_for(6), Duration::from_millis(5_000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = RetryBackoff::new(BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        });

        for _ in 0..50 {
            let delay = backoff.delay_for(1).as_millis();
            assert!((900..=1_100).contains(&delay), "delay {} out of range", delay);
        }
    }
}
