//! The domain action behind one transfer task.

use std::sync::Arc;

use async_trait::async_trait;
use chainbatch_core::policy::{matches_keywords, RetryPredicate};
use chainbatch_core::{BoxError, Task};
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainClient, UnsignedTransfer, WalletSigner};
use crate::error::{ChainError, StepError, TransferStep};
use crate::task::TransferTask;

/// What a successful transfer reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_hash: String,
    /// Gas price actually used, in wei.
    pub gas_price: u128,
    pub gas_limit: u64,
}

/// A [`TransferTask`] bound to the collaborators that execute it.
pub struct TransferJob<C, S> {
    id: String,
    from: String,
    to: String,
    amount: u128,
    gas_price: u128,
    gas_limit: u64,
    data: Vec<u8>,
    auto_gas: bool,
    confirmations: u64,
    chain: Arc<C>,
    signer: Arc<S>,
}

impl<C: ChainClient, S: WalletSigner> TransferJob<C, S> {
    pub fn new(
        task: &TransferTask,
        chain: Arc<C>,
        signer: Arc<S>,
        auto_gas: bool,
        confirmations: u64,
    ) -> Self {
        Self {
            id: task.id.clone(),
            from: task.from.clone(),
            to: task.to.clone(),
            amount: task.amount,
            gas_price: task.gas_price,
            gas_limit: task.gas_limit,
            data: task.data.clone(),
            auto_gas,
            confirmations,
            chain,
            signer,
        }
    }

    async fn perform(&self) -> Result<TransferReceipt, StepError> {
        if !self.signer.has_key(&self.from) {
            return Err(StepError::new(
                TransferStep::ResolveSigner,
                ChainError::Signer(format!("no key for {}", self.from)),
            ));
        }

        let nonce = self
            .chain
            .get_nonce(&self.from)
            .await
            .map_err(|e| StepError::new(TransferStep::GetNonce, e))?;

        let mut tx = UnsignedTransfer {
            nonce,
            from: self.from.clone(),
            to: self.to.clone(),
            value: self.amount,
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
            data: self.data.clone(),
        };

        if self.auto_gas {
            tx.gas_price = self
                .chain
                .suggest_gas_price()
                .await
                .map_err(|e| StepError::new(TransferStep::SuggestGasPrice, e))?;
            tx.gas_limit = self
                .chain
                .estimate_gas(&tx)
                .await
                .map_err(|e| StepError::new(TransferStep::EstimateGas, e))?;
        }

        let signed = self
            .signer
            .sign(&self.from, &tx, self.chain.chain_id())
            .map_err(|e| StepError::new(TransferStep::Sign, e))?;

        let tx_hash = self
            .chain
            .send_transaction(&signed)
            .await
            .map_err(|e| StepError::new(TransferStep::Send, e))?;
        tracing::debug!(task_id = %self.id, %tx_hash, nonce, "transfer sent");

        if self.confirmations > 0 {
            self.chain
                .wait_for_confirmation(&tx_hash, self.confirmations)
                .await
                .map_err(|e| {
                    StepError::new(
                        TransferStep::Confirm,
                        ChainError::Confirmation {
                            tx_hash: tx_hash.clone(),
                            reason: e.to_string(),
                        },
                    )
                })?;
        }

        Ok(TransferReceipt {
            tx_hash,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
        })
    }
}

#[async_trait]
impl<C: ChainClient, S: WalletSigner> Task for TransferJob<C, S> {
    type Output = TransferReceipt;

    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<TransferReceipt, BoxError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("transfer cancelled".into()),
            res = self.perform() => res.map_err(Into::into),
        }
    }
}

/// Retry classification for transfers.
///
/// A failure after broadcast is never retried, since the retry would send a
/// second transaction. Everything else falls back to keyword matching.
pub fn transfer_retry_predicate(keywords: Vec<String>) -> RetryPredicate {
    Arc::new(move |err: &(dyn std::error::Error + Send + Sync + 'static)| {
        if let Some(step) = err.downcast_ref::<StepError>() {
            if step.is_after_broadcast() {
                return false;
            }
        }
        matches_keywords(err, &keywords)
    })
}
