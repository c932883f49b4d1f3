//! Transfer task records and run-level aggregates.

use std::time::Duration;

use chainbatch_core::TaskResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::TransferReceipt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

/// One planned transfer and, once the run has seen its result, its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TransferTask {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Value in wei.
    pub amount: u128,
    /// Gas price in wei; replaced by the effective price after execution.
    pub gas_price: u128,
    pub gas_limit: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl TransferTask {
    /// Fee in wei at the task's gas price and limit.
    pub fn fee(&self) -> u128 {
        self.gas_price.saturating_mul(u128::from(self.gas_limit))
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Copy a worker's outcome onto this task.
    pub(crate) fn apply(&mut self, result: TaskResult<TransferReceipt>) {
        let TaskResult {
            output,
            error,
            start_time,
            end_time,
            ..
        } = result;
        self.start_time = Some(start_time);
        self.end_time = Some(end_time);
        match output {
            Some(receipt) => {
                self.status = TaskStatus::Completed;
                self.tx_hash = Some(receipt.tx_hash);
                self.gas_price = receipt.gas_price;
                self.gas_limit = receipt.gas_limit;
                self.error = None;
            }
            None => {
                self.status = TaskStatus::Failed;
                self.error = Some(
                    error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "task failed without an error".to_string()),
                );
            }
        }
    }
}

/// Aggregate outcome of a completed run. `tasks` is in generation order.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    /// Sum of amounts over completed tasks, in wei.
    pub total_amount: u128,
    /// Sum of fees over completed tasks, in wei.
    pub total_fees: u128,
    pub duration: Duration,
    pub tasks: Vec<TransferTask>,
}

impl TransferResult {
    pub fn from_tasks(tasks: Vec<TransferTask>, duration: Duration) -> Self {
        let mut result = Self {
            total_tasks: tasks.len(),
            successful: 0,
            failed: 0,
            total_amount: 0,
            total_fees: 0,
            duration,
            tasks: Vec::new(),
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Completed => {
                    result.successful += 1;
                    result.total_amount = result.total_amount.saturating_add(task.amount);
                    result.total_fees = result.total_fees.saturating_add(task.fee());
                }
                TaskStatus::Failed => result.failed += 1,
                TaskStatus::Pending => {}
            }
        }
        result.tasks = tasks;
        result
    }

    /// Fraction of tasks that completed, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_tasks as f64
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TransferTask> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }
}

/// Live counters for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub total_transfers: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_amount: u128,
    pub total_gas_cost: u128,
    /// Sum of per-task execution time.
    pub total_duration: Duration,
}

impl TransferStats {
    pub(crate) fn record(&mut self, task: &TransferTask, duration: Duration) {
        self.total_transfers += 1;
        self.total_duration += duration;
        match task.status {
            TaskStatus::Completed => {
                self.success_count += 1;
                self.total_amount = self.total_amount.saturating_add(task.amount);
                self.total_gas_cost = self.total_gas_cost.saturating_add(task.fee());
            }
            _ => self.failure_count += 1,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_transfers as f64
    }

    pub fn average_duration(&self) -> Duration {
        if self.total_transfers == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(self.total_transfers);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}
