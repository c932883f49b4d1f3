//! Consecutive-failure circuit breaker.
//!
//! ```text
//!            max_failures reached
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ reset_timeout since last failure
//!     │ probe ok                       ▼
//!     └──────────────────────────── HalfOpen ── probe fails ──▶ Open
//! ```
//!
//! Clones share one state record, so a single breaker can guard every worker
//! of a pool. The lock covers bookkeeping only, never the guarded call.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Rejecting every call.
    Open,
    /// Letting a probe through after the reset timeout.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures in a row that trip the breaker.
    pub max_failures: u32,
    /// Quiet period after the last failure before a probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            reset_timeout: Duration::from_secs(300),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<Instant>,
}

impl BreakerState {
    /// Promote Open to HalfOpen once the quiet period is over.
    fn refresh(&mut self, reset_timeout: Duration) {
        if self.state != CircuitState::Open {
            return;
        }
        let quiet = self
            .last_failure_at
            .map_or(true, |at| at.elapsed() >= reset_timeout);
        if quiet {
            self.state = CircuitState::HalfOpen;
            tracing::info!("circuit breaker half-open, allowing probe");
        }
    }
}

/// Shared circuit breaker. Cloning yields a handle to the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    shared: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_at: None,
            })),
        }
    }

    /// Current state. Reading it may move Open to HalfOpen.
    pub fn state(&self) -> CircuitState {
        let mut guard = self.shared.lock().unwrap();
        guard.refresh(self.config.reset_timeout);
        guard.state
    }

    /// Whether a call made now would be attempted.
    pub fn is_allowed(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.shared.lock().unwrap().failures
    }

    pub fn record_success(&self) {
        let mut guard = self.shared.lock().unwrap();
        if guard.state != CircuitState::Closed {
            tracing::info!(previous = %guard.state, "circuit breaker closed");
        }
        guard.state = CircuitState::Closed;
        guard.failures = 0;
    }

    pub fn record_failure(&self) {
        let mut guard = self.shared.lock().unwrap();
        guard.failures = guard.failures.saturating_add(1);
        guard.last_failure_at = Some(Instant::now());
        let tripped = guard.failures >= self.config.max_failures;
        if tripped && guard.state != CircuitState::Open {
            tracing::warn!(
                failures = guard.failures,
                reset_timeout_secs = self.config.reset_timeout.as_secs(),
                "circuit breaker opened"
            );
        }
        if tripped {
            guard.state = CircuitState::Open;
        }
    }

    /// Run `f` unless the breaker is open, recording the outcome.
    ///
    /// An open breaker yields [`ExecError::CircuitOpen`] and `f` is never
    /// invoked. [`ExecError::Cancelled`] passes through unrecorded.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, ExecError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ExecError>,
    {
        if !self.is_allowed() {
            return Err(ExecError::CircuitOpen);
        }
        let outcome: Result<T, ExecError> = f().await.map_err(Into::into);
        match &outcome {
            Ok(_) => self.record_success(),
            Err(e) if e.is_cancelled() => {}
            Err(_) => self.record_failure(),
        }
        outcome
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .field("max_failures", &self.config.max_failures)
            .finish()
    }
}
