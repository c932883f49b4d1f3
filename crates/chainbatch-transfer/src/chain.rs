//! Collaborator traits for the chain node and the wallet keystore.
//!
//! The orchestrator never talks to a node or holds keys itself; it drives
//! these two seams. Implementations must be safe to share across workers.

use async_trait::async_trait;

use crate::error::ChainError;

/// A native-value transfer before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransfer {
    pub nonce: u64,
    pub from: String,
    pub to: String,
    /// Value in wei.
    pub value: u128,
    pub gas_limit: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    pub data: Vec<u8>,
}

/// A transfer ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub from: String,
    pub nonce: u64,
    pub chain_id: u64,
    /// Encoded signed transaction bytes.
    pub raw: Vec<u8>,
}

/// Read and write access to a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Chain id used when signing.
    fn chain_id(&self) -> u64;

    /// Next usable nonce for `address`, counting pending transactions.
    async fn get_nonce(&self, address: &str) -> Result<u64, ChainError>;

    /// Current gas price suggestion in wei.
    async fn suggest_gas_price(&self) -> Result<u128, ChainError>;

    /// Gas needed to execute `tx`.
    async fn estimate_gas(&self, tx: &UnsignedTransfer) -> Result<u64, ChainError>;

    /// Broadcast a signed transfer, returning its transaction hash.
    async fn send_transaction(&self, tx: &SignedTransfer) -> Result<String, ChainError>;

    /// Block until `tx_hash` has `confirmations` confirmations.
    async fn wait_for_confirmation(&self, tx_hash: &str, confirmations: u64)
        -> Result<(), ChainError>;
}

/// Holds the keys for a set of wallets.
pub trait WalletSigner: Send + Sync + 'static {
    /// Addresses this signer can sign for, in a stable order.
    fn addresses(&self) -> Vec<String>;

    /// Returns `true` if a key for `address` is available.
    fn has_key(&self, address: &str) -> bool {
        self.addresses().iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Sign `tx` on behalf of `from`.
    fn sign(&self, from: &str, tx: &UnsignedTransfer, chain_id: u64)
        -> Result<SignedTransfer, ChainError>;
}
