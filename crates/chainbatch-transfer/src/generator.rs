//! Expands a transfer mode and an ordered identity list into tasks.

use rand::Rng;

use crate::config::{AmountPolicy, TransferConfig, TransferMode};
use crate::error::TransferError;
use crate::task::{TaskStatus, TransferTask};

/// Amount used when the policy specifies neither a fixed value nor a range (1 ether).
pub const DEFAULT_AMOUNT_WEI: u128 = 1_000_000_000_000_000_000;

/// Minimum identities every mode needs to produce at least one transfer.
pub const MIN_WALLETS: usize = 2;

impl TransferMode {
    /// `(index, from, to)` triples for `n` identities. `index` feeds the task id.
    pub fn pairs(&self, n: usize) -> Vec<(usize, usize, usize)> {
        if n < MIN_WALLETS {
            return vec![];
        }
        match self {
            Self::OneToOne => (0..n - 1).map(|i| (i, i, i + 1)).collect(),
            Self::OneToMany => (1..n).map(|i| (i, 0, i)).collect(),
            Self::ManyToOne => (0..n - 1).map(|i| (i, i, n - 1)).collect(),
            Self::ManyToMany => (0..n).map(|i| (i, i, (i + 1) % n)).collect(),
        }
    }
}

impl AmountPolicy {
    /// Pick the amount for one task.
    pub fn resolve<R: Rng>(&self, rng: &mut R) -> u128 {
        if let Some(fixed) = self.fixed {
            return fixed;
        }
        match (self.min, self.max) {
            (Some(min), Some(max)) if max > min => rng.gen_range(min..max),
            (Some(min), Some(_)) => min,
            _ => DEFAULT_AMOUNT_WEI,
        }
    }
}

/// Builds the task list for one run.
#[derive(Debug, Clone)]
pub struct TaskGenerator<'a> {
    mode: TransferMode,
    amount: &'a AmountPolicy,
    gas_price: u128,
    gas_limit: u64,
    data: &'a [u8],
}

impl<'a> TaskGenerator<'a> {
    pub fn new(config: &'a TransferConfig) -> Self {
        Self {
            mode: config.mode,
            amount: &config.amount,
            gas_price: config.gas_price,
            gas_limit: config.gas_limit,
            data: &config.data,
        }
    }

    pub fn generate(&self, wallets: &[String]) -> Result<Vec<TransferTask>, TransferError> {
        self.generate_with_rng(wallets, &mut rand::thread_rng())
    }

    /// Same as [`generate`](Self::generate) with a caller-chosen RNG for amounts.
    pub fn generate_with_rng<R: Rng>(
        &self,
        wallets: &[String],
        rng: &mut R,
    ) -> Result<Vec<TransferTask>, TransferError> {
        if wallets.len() < MIN_WALLETS {
            return Err(TransferError::NotEnoughWallets {
                mode: self.mode,
                needed: MIN_WALLETS,
                got: wallets.len(),
            });
        }
        self.amount.validate()?;

        let tasks = self
            .mode
            .pairs(wallets.len())
            .into_iter()
            .map(|(index, from, to)| TransferTask {
                id: format!("{}-{}", self.mode, index),
                from: wallets[from].clone(),
                to: wallets[to].clone(),
                amount: self.amount.resolve(rng),
                gas_price: self.gas_price,
                gas_limit: self.gas_limit,
                data: self.data.to_vec(),
                status: TaskStatus::Pending,
                tx_hash: None,
                error: None,
                start_time: None,
                end_time: None,
            })
            .collect::<Vec<_>>();

        tracing::debug!(mode = %self.mode, wallets = wallets.len(), tasks = tasks.len(), "generated transfer tasks");
        Ok(tasks)
    }
}
