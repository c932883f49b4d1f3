//! The `Task` trait and the per-task execution record.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ExecError};

/// An identifiable unit of work.
///
/// `execute` may be called more than once when a retry policy is active, so
/// implementations must be safe to re-run. Execution outcome is never stored
/// on the task itself; the pool reports it in a [`TaskResult`].
///
/// # Thread Safety
/// Tasks move between Tokio tasks, so implementations must be `Send + Sync`.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Value produced by a successful execution.
    type Output: Send + 'static;

    /// Stable identifier used to correlate the result back to this task.
    fn id(&self) -> &str;

    /// Run the task once. Long-running work should observe `cancel`.
    async fn execute(&self, cancel: &CancellationToken) -> Result<Self::Output, BoxError>;
}

/// A plain callable paired with an identifier.
pub struct FnTask<F> {
    id: String,
    f: F,
}

impl<F> FnTask<F> {
    pub fn new(id: impl Into<String>, f: F) -> Self {
        Self { id: id.into(), f }
    }
}

#[async_trait]
impl<F, Fut, T> Task for FnTask<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<T, BoxError> {
        (self.f)(cancel.clone()).await
    }
}

/// Outcome of one submitted task, created exactly once by the worker that ran it.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub success: bool,
    /// Present when the task produced a value.
    pub output: Option<T>,
    pub error: Option<ExecError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Wall time of the whole execute-with-retry sequence.
    pub duration: Duration,
}

impl<T> TaskResult<T> {
    pub(crate) fn from_outcome(
        task_id: String,
        outcome: Result<T, ExecError>,
        start_time: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let end_time = Utc::now();
        match outcome {
            Ok(output) => Self {
                task_id,
                success: true,
                output: Some(output),
                error: None,
                start_time,
                end_time,
                duration,
            },
            Err(err) => Self {
                task_id,
                success: false,
                output: None,
                error: Some(err),
                start_time,
                end_time,
                duration,
            },
        }
    }

    /// Error text, if the task failed.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}
