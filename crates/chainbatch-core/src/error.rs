//! Execution and pool error types.

use thiserror::Error;

/// Opaque error returned by a task's domain action.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while executing a unit of work through the policy stack.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The task failed and no retry policy was applied.
    #[error("{0}")]
    Task(BoxError),

    /// The retry executor gave up. `source` is the last error seen.
    #[error("retry failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// Circuit breaker is open; the task was not attempted.
    #[error("circuit breaker open, call rejected")]
    CircuitOpen,

    /// The shared cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The task panicked; the payload message is kept when it is a string.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl ExecError {
    /// Returns `true` if this error came from cancellation rather than the task.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the breaker rejected the call without running it.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

impl From<BoxError> for ExecError {
    fn from(err: BoxError) -> Self {
        Self::Task(err)
    }
}

/// Errors returned by the worker pool's control surface.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Cancellation has begun; no more submissions are accepted.
    #[error("worker pool stopped")]
    Stopped,

    /// The bounded task queue has no free slot.
    #[error("task queue full")]
    QueueFull,

    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}
