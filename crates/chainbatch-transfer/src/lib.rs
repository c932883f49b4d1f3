//! chainbatch-transfer: batch native-value transfers on top of chainbatch-core.
//!
//! # Overview
//!
//! A run turns a [`TransferConfig`] and a wallet list into a set of
//! [`TransferTask`]s, executes them concurrently through a rate-limited,
//! retrying, circuit-broken worker pool, and reports a [`TransferResult`].
//!
//! The chain node and the keystore are abstract: supply a [`ChainClient`]
//! and a [`WalletSigner`].
//!
//! ```rust,ignore
//! let config = TransferConfig::new(TransferMode::ManyToMany);
//! let orchestrator = TransferOrchestrator::new(config, Arc::new(client), Arc::new(keystore))?;
//! let result = orchestrator.run().await?;
//! println!("{}/{} transfers succeeded", result.successful, result.total_tasks);
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod generator;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod task;

pub use chain::{ChainClient, SignedTransfer, UnsignedTransfer, WalletSigner};
pub use config::{AmountPolicy, TransferConfig, TransferMode, MIN_RATE_LIMIT};
pub use error::{ChainError, StepError, TransferError, TransferStep};
pub use generator::{TaskGenerator, DEFAULT_AMOUNT_WEI};
pub use job::{TransferJob, TransferReceipt};
pub use logging::{init_tracing, LogConfig};
pub use orchestrator::TransferOrchestrator;
pub use task::{TaskStatus, TransferResult, TransferStats, TransferTask};
