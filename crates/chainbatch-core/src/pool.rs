//! Bounded worker pool: one task queue, N Tokio workers, one result queue.
//!
//! Each worker loops: receive a task → wait on the rate limiter → run the
//! task through the optional breaker/retry stack → publish a [`TaskResult`].
//! Results arrive in completion order, not submission order; correlate them
//! by [`TaskResult::task_id`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ExecError, PoolError};
use crate::policy::{CircuitBreaker, RateLimiter, RetryExecutor};
use crate::task::{Task, TaskResult};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of long-lived workers.
    pub worker_count: usize,
    /// Capacity of the task queue (and of the result queue).
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_capacity: 20,
        }
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub worker_count: usize,
    pub queued_tasks: usize,
    pub queue_capacity: usize,
}

/// State shared by every worker of one pool.
struct Shared<T: Task> {
    queue: Mutex<mpsc::Receiver<T>>,
    cancel: CancellationToken,
    rate_limiter: Option<Arc<RateLimiter>>,
    retry: Option<RetryExecutor>,
    breaker: Option<CircuitBreaker>,
}

impl<T: Task> Shared<T> {
    async fn execute(&self, task: T) -> TaskResult<T::Output> {
        let start_time = Utc::now();
        let clock = Instant::now();

        let outcome = match &self.breaker {
            Some(breaker) => breaker.call(|| self.attempt(&task)).await,
            None => self.attempt(&task).await,
        };
        if let Err(e) = &outcome {
            tracing::debug!(task_id = task.id(), error = %e, "task failed");
        }

        TaskResult::from_outcome(task.id().to_string(), outcome, start_time, clock.elapsed())
    }

    async fn attempt(&self, task: &T) -> Result<T::Output, ExecError> {
        let cancel = &self.cancel;
        if let Some(retry) = &self.retry {
            return retry
                .execute_with_cancel(cancel, || run_guarded(task, cancel))
                .await;
        }

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        match run_guarded(task, cancel).await {
            Ok(value) => Ok(value),
            Err(_) if cancel.is_cancelled() => Err(ExecError::Cancelled),
            Err(e) => Err(match e.downcast::<ExecError>() {
                Ok(inner) => *inner,
                Err(e) => ExecError::Task(e),
            }),
        }
    }
}

/// Run one attempt, turning a panic into an [`ExecError::Panicked`] failure
/// so the worker survives and the task still gets its result.
async fn run_guarded<T: Task>(
    task: &T,
    cancel: &CancellationToken,
) -> Result<T::Output, BoxError> {
    match AssertUnwindSafe(task.execute(cancel)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task_id = task.id(), panic = %message, "task panicked");
            Err(Box::new(ExecError::Panicked(message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_worker<T: Task>(
    worker: usize,
    shared: Arc<Shared<T>>,
    results: mpsc::Sender<TaskResult<T::Output>>,
) {
    tracing::debug!(worker, "worker started");
    loop {
        let task = {
            let mut queue = shared.queue.lock().await;
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                task = queue.recv() => task,
            }
        };
        let Some(task) = task else { break };

        if let Some(limiter) = &shared.rate_limiter {
            if limiter.wait(&shared.cancel).await.is_err() {
                break;
            }
        }

        let result = shared.execute(task).await;

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            sent = results.send(result) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker, "worker exited");
}

/// Fixed-size pool of Tokio workers consuming a shared bounded queue.
///
/// Rate limiter, retry executor and circuit breaker are all optional and
/// owned by the pool; composition is the caller's choice.
pub struct WorkerPool<T: Task> {
    config: WorkerPoolConfig,
    cancel: CancellationToken,
    task_tx: Option<mpsc::Sender<T>>,
    task_rx: Option<mpsc::Receiver<T>>,
    result_tx: Option<mpsc::Sender<TaskResult<T::Output>>>,
    result_rx: Option<mpsc::Receiver<TaskResult<T::Output>>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    retry: Option<RetryExecutor>,
    breaker: Option<CircuitBreaker>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Task> WorkerPool<T> {
    /// Build a pool; nothing runs until [`WorkerPool::start`].
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.worker_count == 0 {
            return Err(PoolError::InvalidConfig("worker_count must be > 0".into()));
        }
        if config.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        let (task_tx, task_rx) = mpsc::channel(config.queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            task_tx: Some(task_tx),
            task_rx: Some(task_rx),
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            rate_limiter: None,
            retry: None,
            breaker: None,
            workers: Vec::new(),
        })
    }

    /// Throttle every task through `limiter` before execution.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Re-run failing tasks according to `retry`.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Wrap each task's full retry sequence in `breaker`.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Tie the pool's cancellation to `parent`: cancelling it stops the pool.
    pub fn with_parent_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Launch exactly `worker_count` workers.
    pub fn start(&mut self) -> Result<(), PoolError> {
        let task_rx = self.task_rx.take().ok_or(PoolError::AlreadyStarted)?;
        let result_tx = self.result_tx.take().ok_or(PoolError::AlreadyStarted)?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(task_rx),
            cancel: self.cancel.clone(),
            rate_limiter: self.rate_limiter.clone(),
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
        });

        for worker in 0..self.config.worker_count {
            let handle = tokio::spawn(run_worker(worker, Arc::clone(&shared), result_tx.clone()));
            self.workers.push(handle);
        }
        tracing::info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            "worker pool started"
        );
        Ok(())
    }

    /// Enqueue without blocking.
    ///
    /// Fails with [`PoolError::Stopped`] once cancellation has begun and with
    /// [`PoolError::QueueFull`] when no slot is free.
    pub fn submit(&self, task: T) -> Result<(), PoolError> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::Stopped);
        }
        let tx = self.task_tx.as_ref().ok_or(PoolError::Stopped)?;
        tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => PoolError::QueueFull,
            TrySendError::Closed(_) => PoolError::Stopped,
        })
    }

    /// Hand the result channel to its single consumer. Returns `None` on later calls.
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<TaskResult<T::Output>>> {
        self.result_rx.take()
    }

    /// Cancel, close the queue, and wait for every worker to exit.
    ///
    /// Once this returns no further results are published and the result
    /// channel is closed.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.task_tx.take();
        self.result_tx.take();

        for joined in join_all(self.workers.drain(..)).await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "worker terminated abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }

    /// The pool's cancellation token. Cancelling it has the effect of `stop`
    /// without waiting for workers.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stats(&self) -> PoolStats {
        let queued_tasks = self
            .task_tx
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());
        PoolStats {
            worker_count: self.config.worker_count,
            queued_tasks,
            queue_capacity: self.config.queue_capacity,
        }
    }
}

impl<T: Task> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::policy::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
    use crate::task::FnTask;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Sleeps for `delay`, observing cancellation.
    struct SleepTask {
        id: String,
        delay: Duration,
    }

    #[async_trait]
    impl Task for SleepTask {
        type Output = ();

        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
            tokio::select! {
                _ = cancel.cancelled() => Err("cancelled".into()),
                _ = tokio::time::sleep(self.delay) => Ok(()),
            }
        }
    }

    fn config(workers: usize, capacity: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: workers,
            queue_capacity: capacity,
        }
    }

    #[tokio::test]
    async fn every_task_yields_one_result() {
        let mut pool = WorkerPool::new(config(4, 32)).unwrap();
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        let mut submitted = HashSet::new();
        for i in 0..32u64 {
            let id = format!("task-{i}");
            submitted.insert(id.clone());
            pool.submit(FnTask::new(id, move |_c: CancellationToken| async move {
                // Vary completion order.
                tokio::time::sleep(Duration::from_millis((32 - i) % 7)).await;
                Ok::<u64, BoxError>(i)
            }))
            .unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..32 {
            let r = results.recv().await.unwrap();
            assert!(r.success);
            assert_eq!(r.output, r.task_id.trim_start_matches("task-").parse().ok());
            assert!(seen.insert(r.task_id), "duplicate result");
        }
        assert_eq!(seen, submitted);

        pool.stop().await;
        assert!(results.recv().await.is_none());
    }

    /// Returns 7, or panics when `panics` is set.
    struct PanicTask {
        id: String,
        panics: bool,
    }

    #[async_trait]
    impl Task for PanicTask {
        type Output = u32;

        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _cancel: &CancellationToken) -> Result<u32, BoxError> {
            if self.panics {
                panic!("nonce cache poisoned");
            }
            Ok(7)
        }
    }

    fn maybe_panicking(id: &str, panics: bool) -> PanicTask {
        PanicTask {
            id: id.into(),
            panics,
        }
    }

    #[tokio::test]
    async fn panicking_task_fails_alone() {
        let mut pool = WorkerPool::new(config(1, 4)).unwrap();
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        pool.submit(maybe_panicking("boom", true)).unwrap();
        pool.submit(maybe_panicking("ok", false)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .expect("worker still publishing");
        assert_eq!(first.task_id, "boom");
        assert!(!first.success);
        match first.error {
            Some(ExecError::Panicked(message)) => assert_eq!(message, "nonce cache poisoned"),
            other => panic!("unexpected: {other:?}"),
        }

        let second = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .expect("worker still publishing");
        assert_eq!(second.task_id, "ok");
        assert_eq!(second.output, Some(7));
        pool.stop().await;
    }

    #[tokio::test]
    async fn panic_under_retry_is_not_retried() {
        let retry = RetryExecutor::new(RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        });
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let mut pool = WorkerPool::new(config(1, 2))
            .unwrap()
            .with_retry(retry)
            .with_circuit_breaker(breaker.clone());
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        pool.submit(maybe_panicking("boom", true)).unwrap();
        let r = results.recv().await.unwrap();
        match r.error {
            Some(ExecError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert!(source.to_string().contains("nonce cache poisoned"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(breaker.failure_count(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn submit_rejects_when_queue_full() {
        let pool = WorkerPool::new(config(1, 2)).unwrap();
        for i in 0..2 {
            pool.submit(SleepTask {
                id: format!("t{i}"),
                delay: Duration::ZERO,
            })
            .unwrap();
        }
        let err = pool
            .submit(SleepTask {
                id: "t2".into(),
                delay: Duration::ZERO,
            })
            .unwrap_err();
        assert!(matches!(err, PoolError::QueueFull));
        assert_eq!(pool.stats().queued_tasks, 2);
        assert_eq!(pool.stats().queue_capacity, 2);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let mut pool: WorkerPool<SleepTask> = WorkerPool::new(config(2, 4)).unwrap();
        pool.start().unwrap();
        pool.stop().await;
        let err = pool
            .submit(SleepTask {
                id: "late".into(),
                delay: Duration::ZERO,
            })
            .unwrap_err();
        assert!(matches!(err, PoolError::Stopped));
    }

    #[tokio::test]
    async fn start_twice_and_bad_config() {
        let mut pool: WorkerPool<SleepTask> = WorkerPool::new(config(1, 1)).unwrap();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
        pool.stop().await;

        assert!(matches!(
            WorkerPool::<SleepTask>::new(config(0, 1)),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorkerPool::<SleepTask>::new(config(1, 0)),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn stop_interrupts_in_flight_tasks() {
        let mut pool = WorkerPool::new(config(3, 8)).unwrap();
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();
        for i in 0..6 {
            pool.submit(SleepTask {
                id: format!("slow-{i}"),
                delay: Duration::from_secs(30),
            })
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        pool.stop().await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(results.recv().await.is_none(), "no results after stop");
    }

    #[tokio::test]
    async fn parent_cancellation_stops_workers() {
        let parent = CancellationToken::new();
        let mut pool = WorkerPool::new(config(2, 4))
            .unwrap()
            .with_parent_cancellation(&parent);
        pool.start().unwrap();
        pool.submit(SleepTask {
            id: "slow".into(),
            delay: Duration::from_secs(30),
        })
        .unwrap();

        parent.cancel();
        assert!(matches!(
            pool.submit(SleepTask {
                id: "x".into(),
                delay: Duration::ZERO
            }),
            Err(PoolError::Stopped)
        ));
        tokio::time::timeout(Duration::from_secs(2), pool.stop())
            .await
            .expect("stop returns promptly");
    }

    #[tokio::test]
    async fn retry_duration_covers_all_attempts() {
        let retry = RetryExecutor::new(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        });
        let mut pool = WorkerPool::new(config(1, 1)).unwrap().with_retry(retry);
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        pool.submit(FnTask::new("flaky", move |_c: CancellationToken| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err::<u32, BoxError>("gateway timeout".into())
                } else {
                    Ok(n)
                }
            }
        }))
        .unwrap();

        let r = results.recv().await.unwrap();
        assert!(r.success, "error: {:?}", r.error_message());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20ms + 40ms of backoff
        assert!(r.duration >= Duration::from_millis(60), "{:?}", r.duration);
        pool.stop().await;
    }

    #[tokio::test]
    async fn breaker_rejects_after_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 2,
            reset_timeout: Duration::from_secs(60),
        });
        let mut pool = WorkerPool::new(config(1, 5))
            .unwrap()
            .with_circuit_breaker(breaker.clone());
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        for i in 0..5 {
            pool.submit(FnTask::new(format!("f{i}"), |_c: CancellationToken| async {
                Err::<(), BoxError>("insufficient funds".into())
            }))
            .unwrap();
        }

        let mut open = 0;
        let mut failed = 0;
        for _ in 0..5 {
            let r = results.recv().await.unwrap();
            assert!(!r.success);
            match r.error {
                Some(ExecError::CircuitOpen) => open += 1,
                Some(ExecError::Task(_)) => failed += 1,
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!((failed, open), (2, 3));
        pool.stop().await;
    }

    #[tokio::test]
    async fn rate_limiter_spaces_tasks() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::FixedInterval { rate: 20.0 }));
        let mut pool = WorkerPool::new(config(4, 8))
            .unwrap()
            .with_rate_limiter(limiter);
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        let start = Instant::now();
        for i in 0..5 {
            pool.submit(SleepTask {
                id: format!("r{i}"),
                delay: Duration::ZERO,
            })
            .unwrap();
        }
        for _ in 0..5 {
            results.recv().await.unwrap();
        }
        // 4 gaps of 50ms
        assert!(start.elapsed() >= Duration::from_millis(200));
        pool.stop().await;
    }
}
