//! Policy engine: composable middleware for task reliability.
//!
//! The policy stack (applied by each pool worker, in order):
//! ```text
//! Task → [RateLimiter] → [CircuitBreaker] → [RetryExecutor] → Task::execute
//! ```

use std::time::Duration;

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{IntervalLimiter, RateLimiter, RateLimiterConfig, TokenBucket, MAX_RATE_WAIT};
pub use retry::{
    matches_keywords, RetryConfig, RetryExecutor, RetryPolicy, RetryPredicate,
    DEFAULT_RETRYABLE_KEYWORDS,
};

/// Seconds to a `Duration` clamped to `[0, max]`. NaN and negatives map to zero.
pub(crate) fn clamp_secs(secs: f64, max: Duration) -> Duration {
    if !(secs > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).map_or(max, |d| d.min(max))
}
