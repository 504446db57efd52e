//! Rate limiting for the HTTP API using the token bucket algorithm.
//!
//! Clients are keyed by API key when one is presented, otherwise by client IP.

mod limiter;
mod token_bucket;

pub use limiter::{RateLimitResult, RateLimiter};
pub use token_bucket::TokenBucket;
