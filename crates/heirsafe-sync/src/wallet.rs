use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::WalletError;

/// Notification from the wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    AccountChanged(Option<Address>),
    NetworkChanged(u64),
}

/// A transaction for the wallet to sign and submit from its current account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl TxRequest {
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self { to, data: data.into(), value: U256::ZERO }
    }
}

/// How a submitted transaction settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxSettlement {
    Confirmed { tx_hash: B256, block_number: u64 },
    Reverted { tx_hash: B256, reason: Option<String> },
}

/// Wallet connectivity as seen by the client.
///
/// Covers the current account and network, network switching, and signing
/// plus submission. Changes are pushed through [`WalletCapability::subscribe`].
#[async_trait]
pub trait WalletCapability: Send + Sync {
    async fn current_account(&self) -> Result<Option<Address>, WalletError>;

    async fn current_chain_id(&self) -> Result<u64, WalletError>;

    /// Asks the wallet to move to `chain_id`. Success is reported through a
    /// [`WalletEvent::NetworkChanged`] as well.
    async fn switch_network(&self, chain_id: u64) -> Result<(), WalletError>;

    /// Signs and submits `tx`, returning its hash once accepted by the node.
    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, WalletError>;

    /// Waits until `tx_hash` is mined.
    async fn wait_for_settlement(&self, tx_hash: B256) -> Result<TxSettlement, WalletError>;

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;
}
