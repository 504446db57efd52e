//! Token bucket for a single client key

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token bucket refilled at a constant rate up to its capacity.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_second: f64,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, refill_per_second: u32) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: now,
                last_seen: now,
            }),
            capacity: capacity.max(1) as f64,
            refill_per_second: refill_per_second.max(1) as f64,
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token, or return how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        state.last_seen = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_second))
        }
    }

    /// Tokens currently available
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, Instant::now());
        state.tokens.floor() as u32
    }

    /// Time since the bucket was last used
    pub fn idle_for(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_seen.elapsed()
    }
}
