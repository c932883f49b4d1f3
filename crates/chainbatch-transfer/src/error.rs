//! Error types for batch transfer runs.

use chainbatch_core::PoolError;
use thiserror::Error;

use crate::config::TransferMode;

/// Run-level errors. Any of these aborts the whole batch.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unsupported transfer mode: {0}")]
    UnknownMode(String),

    #[error("{mode} transfers need at least {needed} wallets, got {got}")]
    NotEnoughWallets {
        mode: TransferMode,
        needed: usize,
        got: usize,
    },

    #[error("invalid amount policy: {0}")]
    InvalidAmount(String),

    #[error("invalid transfer configuration: {0}")]
    InvalidConfig(String),

    /// A task could not be enqueued; nothing after it was submitted.
    #[error("failed to submit task {task_id}: {source}")]
    Submit {
        task_id: String,
        #[source]
        source: PoolError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("transfer run timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("transfer run cancelled")]
    Cancelled,

    #[error("result channel closed with {missing} task(s) outstanding")]
    ResultsClosed { missing: usize },
}

impl TransferError {
    /// Returns `true` for errors caused by bad input rather than execution.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownMode(_)
                | Self::NotEnoughWallets { .. }
                | Self::InvalidAmount(_)
                | Self::InvalidConfig(_)
        )
    }
}

/// Failure reported by a chain or signer collaborator.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Node or transport failure. The message is matched against retry keywords.
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("transaction {tx_hash} not confirmed: {reason}")]
    Confirmation { tx_hash: String, reason: String },
}

/// Stage of a single transfer's domain action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    ResolveSigner,
    GetNonce,
    SuggestGasPrice,
    EstimateGas,
    Sign,
    Send,
    Confirm,
}

impl std::fmt::Display for TransferStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolveSigner => write!(f, "resolve signer"),
            Self::GetNonce => write!(f, "get nonce"),
            Self::SuggestGasPrice => write!(f, "suggest gas price"),
            Self::EstimateGas => write!(f, "estimate gas"),
            Self::Sign => write!(f, "sign transaction"),
            Self::Send => write!(f, "send transaction"),
            Self::Confirm => write!(f, "wait for confirmation"),
        }
    }
}

/// A collaborator failure tagged with the step it happened in.
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct StepError {
    pub step: TransferStep,
    #[source]
    pub source: ChainError,
}

impl StepError {
    pub fn new(step: TransferStep, source: ChainError) -> Self {
        Self { step, source }
    }

    /// Returns `true` once the transfer has been broadcast; re-running would send it twice.
    pub fn is_after_broadcast(&self) -> bool {
        self.step == TransferStep::Confirm
    }
}
