//! Rate limiters: fixed interval and token bucket.
//!
//! Fixed interval spaces grants `1 / rate` seconds apart. Token bucket lets
//! tokens accrue at `refill_rate` per second up to `capacity`; each request
//! consumes `cost` tokens.
//!
//! State lives behind one `std::sync::Mutex` that is only held for the
//! bookkeeping arithmetic, never across a sleep.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::clamp_secs;
use crate::error::ExecError;

/// Upper bound for one token-bucket sleep before re-checking.
const MAX_BUCKET_SLEEP: Duration = Duration::from_secs(1);

/// Longest spacing or wait estimate either limiter reports.
pub const MAX_RATE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Which limiting policy to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimiterConfig {
    /// At most `rate` grants per second, evenly spaced.
    FixedInterval { rate: f64 },
    /// Bursts up to `capacity`, sustained `refill_rate` tokens/second.
    TokenBucket { capacity: f64, refill_rate: f64 },
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::FixedInterval { rate: 10.0 }
    }
}

fn interval_for(rate: f64) -> Duration {
    // Non-positive rates fall back to one grant per second.
    let rate = if rate > 0.0 { rate } else { 1.0 };
    clamp_secs(1.0 / rate, MAX_RATE_WAIT)
}

struct IntervalState {
    rate: f64,
    interval: Duration,
    last_grant: Option<Instant>,
}

/// Thread-safe fixed-interval limiter.
pub struct IntervalLimiter {
    state: Mutex<IntervalState>,
}

impl IntervalLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(IntervalState {
                rate,
                interval: interval_for(rate),
                last_grant: None,
            }),
        }
    }

    /// Wait until a full interval has passed since the last grant, or return
    /// `Cancelled` if `cancel` fires first.
    ///
    /// Only a grant moves `last_grant`; a waiter that gives up reserves nothing.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ExecError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            let remaining = match self.poll_grant() {
                Ok(()) => return Ok(()),
                Err(remaining) => remaining,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Grant immediately if a full interval has passed, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.poll_grant().is_ok()
    }

    /// Take the grant now, or report how long until the next one is due.
    fn poll_grant(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = state.last_grant {
            let due = last + state.interval;
            if now < due {
                return Err(due - now);
            }
        }
        state.last_grant = Some(now);
        Ok(())
    }

    /// Change the rate; takes effect on the next grant computation.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().unwrap();
        state.rate = if rate > 0.0 { rate } else { 1.0 };
        state.interval = interval_for(rate);
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `cost` tokens if the bucket holds them; `false` leaves it untouched.
    pub fn try_consume(&self, cost: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);

        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// How long until `cost` tokens will have accrued, capped at [`MAX_RATE_WAIT`].
    pub fn wait_time(&self, cost: f64) -> Duration {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        let deficit = cost - state.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else if self.refill_rate <= 0.0 {
            MAX_BUCKET_SLEEP
        } else {
            clamp_secs(deficit / self.refill_rate, MAX_RATE_WAIT)
        }
    }

    /// Block until `cost` tokens are consumed, or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken, cost: f64) -> Result<(), ExecError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            if self.try_consume(cost) {
                return Ok(());
            }
            let wait = self.wait_time(cost).min(MAX_BUCKET_SLEEP);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.refill_rate;
        state.tokens = (state.tokens + new_tokens).min(self.capacity);
        state.last_refill = now;
    }
}

/// A rate limiter shared by every worker of one pool.
pub enum RateLimiter {
    Interval(IntervalLimiter),
    Bucket {
        bucket: TokenBucket,
        /// Tokens consumed per grant.
        cost: f64,
    },
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        match config {
            RateLimiterConfig::FixedInterval { rate } => Self::Interval(IntervalLimiter::new(rate)),
            RateLimiterConfig::TokenBucket {
                capacity,
                refill_rate,
            } => Self::Bucket {
                bucket: TokenBucket::new(capacity, refill_rate),
                cost: 1.0,
            },
        }
    }

    /// Block until a grant is available, or return `Cancelled`.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ExecError> {
        match self {
            Self::Interval(limiter) => limiter.wait(cancel).await,
            Self::Bucket { bucket, cost } => bucket.wait(cancel, *cost).await,
        }
    }

    /// Non-blocking variant of [`RateLimiter::wait`].
    pub fn try_acquire(&self) -> bool {
        match self {
            Self::Interval(limiter) => limiter.try_acquire(),
            Self::Bucket { bucket, cost } => bucket.try_consume(*cost),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(limiter) => f
                .debug_struct("RateLimiter::Interval")
                .field("rate", &limiter.rate())
                .finish(),
            Self::Bucket { bucket, cost } => f
                .debug_struct("RateLimiter::Bucket")
                .field("capacity", &bucket.capacity)
                .field("refill_rate", &bucket.refill_rate)
                .field("cost", cost)
                .finish(),
        }
    }
}
