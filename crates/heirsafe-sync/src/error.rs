use alloy_primitives::{Address, B256};
use heirsafe_chainspec::ConfigError;
use heirsafe_primitives::AddressError;
use heirsafe_rpc::ChainError;
use thiserror::Error;

/// Failures of the wallet capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("no wallet account connected")]
    NotConnected,

    #[error("user rejected the request: {0}")]
    Rejected(String),

    #[error("wallet cannot switch to network {0}")]
    UnsupportedNetwork(u64),

    #[error("wallet transport error: {0}")]
    Transport(String),
}

/// Failures of a module state resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid account address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("{address} is not a multi-signature account: {reason}")]
    NotASafeAccount { address: Address, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("module factory {factory} is not deployed on network {chain_id}")]
    FactoryNotDeployed { chain_id: u64, factory: Address },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ResolveError {
    /// Transient failures are absorbed and retried by the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Chain(e) if e.is_transient())
    }
}

/// Failures of a mutating action.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Rejected locally; nothing was submitted.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The dry-run of the exact call failed; nothing was submitted.
    #[error("dry run failed: {reason}")]
    DryRunFailed { reason: String },

    /// Submitted and mined, but reverted.
    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: B256, reason: String },

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl DispatchError {
    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionViolation(reason.into())
    }
}
