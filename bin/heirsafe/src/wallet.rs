use alloy_consensus::{SignableTransaction, TxEip1559};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, TxKind, B256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use heirsafe_chainspec::NetworkTable;
use heirsafe_rpc::{CallRequest, ChainError, RpcClient};
use heirsafe_sync::{TxRequest, TxSettlement, WalletCapability, WalletError, WalletEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Gas estimate headroom, in percent.
const GAS_LIMIT_MARGIN: u64 = 20;
const FALLBACK_PRIORITY_FEE: u128 = 1_000_000_000;
const RECEIPT_POLL: Duration = Duration::from_secs(2);
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(180);

struct Binding {
    chain_id: u64,
    rpc: RpcClient,
}

/// Wallet backed by a local signing key and the network's JSON-RPC endpoint.
///
/// Without a key it is watch-only: it reports no account and refuses to
/// submit.
pub struct LocalWallet {
    signer: Option<PrivateKeySigner>,
    networks: NetworkTable,
    binding: ArcSwap<Binding>,
    events: broadcast::Sender<WalletEvent>,
    /// Serializes nonce lookup and submission.
    send_lock: tokio::sync::Mutex<()>,
    /// Submitted requests, replayed to recover a revert reason.
    submitted: Mutex<HashMap<B256, TxRequest>>,
    receipt_poll: Duration,
    receipt_timeout: Duration,
}

impl LocalWallet {
    pub fn new(
        signer: Option<PrivateKeySigner>,
        networks: NetworkTable,
        chain_id: u64,
    ) -> Result<Self, WalletError> {
        let rpc = rpc_for(&networks, chain_id)?;
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            signer,
            networks,
            binding: ArcSwap::from_pointee(Binding { chain_id, rpc }),
            events,
            send_lock: tokio::sync::Mutex::new(()),
            submitted: Mutex::new(HashMap::new()),
            receipt_poll: RECEIPT_POLL,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    /// How long to wait for a receipt before settlement fails.
    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    fn forget(&self, tx_hash: &B256) -> Option<TxRequest> {
        self.submitted.lock().ok()?.remove(tx_hash)
    }

    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    async fn revert_reason(&self, rpc: &RpcClient, tx_hash: B256, from: Address) -> Option<String> {
        let request = self.forget(&tx_hash)?;
        let call = CallRequest::new(request.to, request.data).with_from(from);
        match rpc.eth_call(&call).await {
            Err(ChainError::Reverted { reason }) => Some(reason),
            Err(e) => {
                debug!(%tx_hash, error = %e, "revert replay failed");
                None
            }
            // The state moved on since the transaction was mined.
            Ok(_) => None,
        }
    }
}

fn rpc_for(networks: &NetworkTable, chain_id: u64) -> Result<RpcClient, WalletError> {
    let url = networks
        .get(chain_id)
        .and_then(|n| n.rpc_url())
        .ok_or(WalletError::UnsupportedNetwork(chain_id))?;
    Ok(RpcClient::new(url))
}

fn transport(e: ChainError) -> WalletError {
    WalletError::Transport(e.to_string())
}

/// Gas limit with headroom over the node's estimate.
fn padded_gas_limit(estimate: u64) -> u64 {
    estimate.saturating_add(estimate / 100 * GAS_LIMIT_MARGIN)
}

/// `(max_fee_per_gas, max_priority_fee_per_gas)` from the node's gas price,
/// leaving room for one base fee doubling.
fn fee_caps(gas_price: u128, priority: u128) -> (u128, u128) {
    let max_fee = gas_price.saturating_mul(2).saturating_add(priority);
    (max_fee, priority.min(max_fee))
}

#[async_trait]
impl WalletCapability for LocalWallet {
    async fn current_account(&self) -> Result<Option<Address>, WalletError> {
        Ok(self.address())
    }

    async fn current_chain_id(&self) -> Result<u64, WalletError> {
        Ok(self.binding.load().chain_id)
    }

    async fn switch_network(&self, chain_id: u64) -> Result<(), WalletError> {
        if self.binding.load().chain_id == chain_id {
            return Ok(());
        }
        let rpc = rpc_for(&self.networks, chain_id)?;
        let reported = rpc.chain_id().await.map_err(transport)?;
        if reported != chain_id {
            return Err(WalletError::Transport(format!(
                "endpoint {} serves chain {reported}, expected {chain_id}",
                rpc.url()
            )));
        }

        self.binding.store(Arc::new(Binding { chain_id, rpc }));
        info!(chain_id, "wallet switched network");
        let _ = self.events.send(WalletEvent::NetworkChanged(chain_id));
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, WalletError> {
        let signer = self.signer.as_ref().ok_or(WalletError::NotConnected)?;
        let from = signer.address();
        let binding = self.binding.load_full();
        let rpc = &binding.rpc;

        let call = CallRequest::new(tx.to, tx.data.clone()).with_from(from);
        let estimate = rpc.estimate_gas(&call).await.map_err(|e| match e {
            ChainError::Reverted { reason } => {
                WalletError::Rejected(format!("transaction would revert: {reason}"))
            }
            other => transport(other),
        })?;
        let gas_price = rpc.gas_price().await.map_err(transport)?;
        let priority = match rpc.max_priority_fee_per_gas().await {
            Ok(fee) => fee,
            Err(e) => {
                warn!(error = %e, "priority fee unavailable, using fallback");
                FALLBACK_PRIORITY_FEE
            }
        };
        let (max_fee_per_gas, max_priority_fee_per_gas) = fee_caps(gas_price, priority);

        let _guard = self.send_lock.lock().await;
        let nonce = rpc.get_nonce(from).await.map_err(transport)?;

        let unsigned = TxEip1559 {
            chain_id: binding.chain_id,
            nonce,
            gas_limit: padded_gas_limit(estimate),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            to: TxKind::Call(tx.to),
            value: tx.value,
            input: tx.data.clone(),
            access_list: Default::default(),
        };
        let sig = signer
            .sign_hash_sync(&unsigned.signature_hash())
            .map_err(|e| WalletError::Rejected(e.to_string()))?;
        let signed = unsigned.into_signed(sig);
        let mut encoded = Vec::new();
        signed.encode_2718(&mut encoded);

        let tx_hash = rpc.send_raw_transaction(&encoded).await.map_err(transport)?;
        info!(%tx_hash, %from, to = %tx.to, nonce, chain_id = binding.chain_id, "transaction submitted");

        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.insert(tx_hash, tx);
        }
        Ok(tx_hash)
    }

    async fn wait_for_settlement(&self, tx_hash: B256) -> Result<TxSettlement, WalletError> {
        let binding = self.binding.load_full();
        let receipt = match binding
            .rpc
            .wait_for_receipt(tx_hash, self.receipt_poll, self.receipt_timeout)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.forget(&tx_hash);
                return Err(transport(e));
            }
        };

        if receipt.succeeded() {
            self.forget(&tx_hash);
            return Ok(TxSettlement::Confirmed { tx_hash, block_number: receipt.block_number });
        }

        let reason = match self.address() {
            Some(from) => self.revert_reason(&binding.rpc, tx_hash, from).await,
            None => None,
        };
        warn!(%tx_hash, block = receipt.block_number, ?reason, "transaction reverted");
        Ok(TxSettlement::Reverted { tx_hash, reason })
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}
