//! Batch transfer orchestrator.
//!
//! One run:
//! 1. expand the configured mode over the wallet list into tasks
//! 2. start a worker pool carrying the shared rate limiter, breaker and retry policy
//! 3. submit every task, then collect exactly one result per task
//! 4. stop the pool and aggregate
//!
//! The limiter and circuit breaker belong to the orchestrator, so their
//! state carries over between runs against the same endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chainbatch_core::policy::{CircuitBreaker, CircuitState, RateLimiter, RetryExecutor};
use chainbatch_core::{PoolError, TaskResult, WorkerPool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainClient, WalletSigner};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::generator::TaskGenerator;
use crate::job::{transfer_retry_predicate, TransferJob, TransferReceipt};
use crate::task::{TransferResult, TransferStats, TransferTask};

pub struct TransferOrchestrator<C, S> {
    config: TransferConfig,
    chain: Arc<C>,
    signer: Arc<S>,
    rate_limiter: Arc<RateLimiter>,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    stats: Mutex<TransferStats>,
}

impl<C: ChainClient, S: WalletSigner> TransferOrchestrator<C, S> {
    /// Validate `config` and build the shared policies.
    pub fn new(config: TransferConfig, chain: Arc<C>, signer: Arc<S>) -> Result<Self, TransferError> {
        config.validate()?;

        let mut retry_config = config.retry_config();
        retry_config.predicate = Some(transfer_retry_predicate(
            retry_config.retryable_keywords.clone(),
        ));

        Ok(Self {
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limiter_config())),
            breaker: CircuitBreaker::new(config.circuit_breaker_config()),
            retry: RetryExecutor::new(retry_config),
            stats: Mutex::new(TransferStats::default()),
            config,
            chain,
            signer,
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Signer wallets followed by the configured receive-only recipients.
    pub fn identities(&self) -> Vec<String> {
        let mut identities = self.signer.addresses();
        identities.extend(self.config.recipients.iter().cloned());
        identities
    }

    /// Plan the run without executing anything.
    pub fn generate_tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        TaskGenerator::new(&self.config).generate(&self.identities())
    }

    /// Counters for the current (or last) run.
    pub fn stats(&self) -> TransferStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub async fn run(&self) -> Result<TransferResult, TransferError> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Execute one batch. Cancelling `cancel` aborts the run with
    /// [`TransferError::Cancelled`] once in-flight work has been interrupted.
    pub async fn run_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<TransferResult, TransferError> {
        let started = Instant::now();
        let mut tasks = self.generate_tasks()?;
        *self.stats.lock().unwrap() = TransferStats::default();

        tracing::info!(
            mode = %self.config.mode,
            tasks = tasks.len(),
            workers = self.config.workers,
            "starting transfer run"
        );

        let mut pool = WorkerPool::new(self.config.pool_config(tasks.len()))?
            .with_parent_cancellation(&cancel)
            .with_rate_limiter(Arc::clone(&self.rate_limiter))
            .with_circuit_breaker(self.breaker.clone())
            .with_retry(self.retry.clone());
        let mut results = pool
            .take_results()
            .ok_or(TransferError::ResultsClosed { missing: tasks.len() })?;
        pool.start()?;

        for task in &tasks {
            let job = TransferJob::new(
                task,
                Arc::clone(&self.chain),
                Arc::clone(&self.signer),
                self.config.auto_gas,
                self.config.confirmations,
            );
            if let Err(source) = pool.submit(job) {
                pool.stop().await;
                return Err(submit_error(&task.id, source, &cancel));
            }
        }

        let collected = self.collect(&mut tasks, &mut results, &cancel).await;
        pool.stop().await;
        collected?;

        let result = TransferResult::from_tasks(tasks, started.elapsed());
        tracing::info!(
            total = result.total_tasks,
            successful = result.successful,
            failed = result.failed,
            total_amount = %result.total_amount,
            total_fees = %result.total_fees,
            duration_ms = result.duration.as_millis() as u64,
            "transfer run finished"
        );
        Ok(result)
    }

    /// Receive until every task has a result, the deadline passes, or `cancel` fires.
    async fn collect(
        &self,
        tasks: &mut [TransferTask],
        results: &mut mpsc::Receiver<TaskResult<TransferReceipt>>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let index: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);

        let mut pending = tasks.len();
        while pending > 0 {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(pending, "transfer run cancelled");
                    return Err(TransferError::Cancelled);
                }
                _ = &mut deadline => {
                    tracing::warn!(pending, "transfer run timed out");
                    return Err(TransferError::Timeout { secs: self.config.timeout_secs });
                }
                received = results.recv() => received,
            };
            let Some(result) = received else {
                return Err(TransferError::ResultsClosed { missing: pending });
            };

            let Some(&i) = index.get(&result.task_id) else {
                tracing::warn!(task_id = %result.task_id, "result for unknown task ignored");
                continue;
            };
            let task = &mut tasks[i];
            if !task.is_pending() {
                tracing::warn!(task_id = %task.id, "duplicate result ignored");
                continue;
            }

            let duration = result.duration;
            task.apply(result);
            match &task.error {
                None => tracing::debug!(
                    task_id = %task.id,
                    tx_hash = task.tx_hash.as_deref().unwrap_or_default(),
                    "transfer completed"
                ),
                Some(error) => tracing::warn!(task_id = %task.id, %error, "transfer failed"),
            }
            self.stats.lock().unwrap().record(task, duration);
            pending -= 1;
        }
        Ok(())
    }
}

/// A submission refused because the caller cancelled is reported as
/// cancellation; anything else aborts the run naming the task.
fn submit_error(task_id: &str, source: PoolError, cancel: &CancellationToken) -> TransferError {
    if cancel.is_cancelled() {
        tracing::warn!(task_id, "transfer run cancelled during submission");
        return TransferError::Cancelled;
    }
    tracing::error!(task_id, error = %source, "submit failed, aborting run");
    TransferError::Submit {
        task_id: task_id.to_string(),
        source,
    }
}

impl<C, S> std::fmt::Debug for TransferOrchestrator<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("mode", &self.config.mode)
            .field("workers", &self.config.workers)
            .field("breaker", &self.breaker)
            .finish()
    }
}
