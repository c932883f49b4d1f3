//! chainbatch-core: the concurrent task-execution engine behind ChainBatch.
//!
//! # Overview
//!
//! The core crate knows nothing about transfers. It runs opaque,
//! identifiable units of work across a bounded set of workers:
//!
//! - [`Task`]: the trait every unit of work implements ([`FnTask`] for closures)
//! - [`TaskResult`]: the per-task outcome published by a worker
//! - [`WorkerPool`]: bounded queue plus N long-lived Tokio workers
//! - [`policy`] module: rate limiter, retry executor, circuit breaker
//! - [`ExecError`] / [`PoolError`]: structured error types

pub mod error;
pub mod policy;
pub mod pool;
pub mod task;

pub use error::{BoxError, ExecError, PoolError};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig};
pub use task::{FnTask, Task, TaskResult};
