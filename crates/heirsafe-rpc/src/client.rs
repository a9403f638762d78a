use alloy_primitives::{Address, Bytes, B256};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

use crate::error::{decode_revert, ChainError, ChainResult};

/// A minimal JSON-RPC client for an Ethereum-compatible node.
///
/// Uses raw `reqwest` HTTP calls; only the handful of methods the client
/// needs are exposed.
#[derive(Debug)]
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl JsonRpcError {
    /// Maps a node error to the chain error taxonomy.
    ///
    /// Nodes report reverts either as code 3 with the payload in `data`, or
    /// only through the message text.
    fn into_chain_error(self) -> ChainError {
        let revert_data = match &self.data {
            Some(Value::String(s)) => hex::decode(s.trim_start_matches("0x")).ok(),
            Some(Value::Object(obj)) => obj
                .get("data")
                .and_then(Value::as_str)
                .and_then(|s| hex::decode(s.trim_start_matches("0x")).ok()),
            _ => None,
        };
        match revert_data {
            Some(data) if !data.is_empty() => ChainError::Reverted { reason: decode_revert(&data) },
            _ if self.code == 3 || self.message.contains("revert") => {
                ChainError::Reverted { reason: self.message }
            }
            _ => ChainError::NetworkUnavailable(self.to_string()),
        }
    }
}

/// Transaction receipt returned by eth_getTransactionReceipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub status: u64,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub block_number: u64,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub gas_used: u64,
    pub contract_address: Option<Address>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

/// The fields of a block header the client reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub number: u64,
    pub hash: B256,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub timestamp: u64,
}

/// An `eth_call` / `eth_estimateGas` request.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
}

impl CallRequest {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self { from: None, to, data: data.into() }
    }

    pub fn with_from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    fn to_json(&self) -> Value {
        let mut params = serde_json::Map::new();
        if let Some(from) = self.from {
            params.insert("from".to_string(), json!(format!("{from:?}")));
        }
        params.insert("to".to_string(), json!(format!("{:?}", self.to)));
        params.insert("data".to_string(), json!(format!("0x{}", hex::encode(&self.data))));
        Value::Object(params)
    }
}

fn deserialize_u64_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_hex_u128(s: &str) -> ChainResult<u128> {
    u128::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::MalformedResponse(format!("bad quantity {s:?}: {e}")))
}

fn decode_hex_bytes(s: &str) -> ChainResult<Bytes> {
    hex::decode(s.trim_start_matches("0x"))
        .map(Bytes::from)
        .map_err(|e| ChainError::MalformedResponse(format!("bad hex data: {e}")))
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            request_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a raw JSON-RPC request.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> ChainResult<T> {
        let id = self.next_id();
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        trace!(method, id, "rpc request");

        let resp = self.client.post(&self.url).json(&body).send().await?;
        let text = resp.text().await?;
        let rpc_resp: JsonRpcResponse<T> = serde_json::from_str(&text).map_err(|e| {
            ChainError::MalformedResponse(format!("failed to parse {method} response: {e}"))
        })?;

        if let Some(err) = rpc_resp.error {
            return Err(err.into_chain_error());
        }

        rpc_resp
            .result
            .ok_or_else(|| ChainError::MalformedResponse(format!("null result from {method}")))
    }

    /// Returns the chain ID.
    pub async fn chain_id(&self) -> ChainResult<u64> {
        let hex: String = self.call("eth_chainId", json!([])).await?;
        parse_hex_u64(&hex).map_err(|e| ChainError::MalformedResponse(e.to_string()))
    }

    /// Returns the runtime code at an address (empty for accounts without code).
    pub async fn get_code(&self, address: Address) -> ChainResult<Bytes> {
        let hex: String = self.call("eth_getCode", json!([format!("{address:?}"), "latest"])).await?;
        decode_hex_bytes(&hex)
    }

    /// Calls eth_call for read-only contract interaction.
    pub async fn eth_call(&self, request: &CallRequest) -> ChainResult<Bytes> {
        let hex: String = self.call("eth_call", json!([request.to_json(), "latest"])).await?;
        decode_hex_bytes(&hex)
    }

    /// Returns the header of the latest block.
    pub async fn latest_block(&self) -> ChainResult<BlockHeader> {
        self.call("eth_getBlockByNumber", json!(["latest", false])).await
    }

    /// Returns the pending-inclusive nonce for an address.
    pub async fn get_nonce(&self, address: Address) -> ChainResult<u64> {
        let hex: String = self
            .call("eth_getTransactionCount", json!([format!("{address:?}"), "pending"]))
            .await?;
        parse_hex_u64(&hex).map_err(|e| ChainError::MalformedResponse(e.to_string()))
    }

    /// Returns the current gas price.
    pub async fn gas_price(&self) -> ChainResult<u128> {
        let hex: String = self.call("eth_gasPrice", json!([])).await?;
        parse_hex_u128(&hex)
    }

    /// Returns the suggested priority fee.
    pub async fn max_priority_fee_per_gas(&self) -> ChainResult<u128> {
        let hex: String = self.call("eth_maxPriorityFeePerGas", json!([])).await?;
        parse_hex_u128(&hex)
    }

    /// Estimates gas for a call.
    pub async fn estimate_gas(&self, request: &CallRequest) -> ChainResult<u64> {
        let hex: String = self.call("eth_estimateGas", json!([request.to_json()])).await?;
        parse_hex_u64(&hex).map_err(|e| ChainError::MalformedResponse(e.to_string()))
    }

    /// Sends a raw signed transaction and returns the tx hash.
    pub async fn send_raw_transaction(&self, raw_tx: &[u8]) -> ChainResult<B256> {
        let hex_tx = format!("0x{}", hex::encode(raw_tx));
        self.call("eth_sendRawTransaction", json!([hex_tx])).await
    }

    /// Returns the transaction receipt, `None` while pending.
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> ChainResult<Option<TransactionReceipt>> {
        match self
            .call::<TransactionReceipt>("eth_getTransactionReceipt", json!([format!("{tx_hash:?}")]))
            .await
        {
            Ok(receipt) => Ok(Some(receipt)),
            Err(ChainError::MalformedResponse(msg)) if msg.starts_with("null result") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Waits for a transaction receipt with polling.
    pub async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        poll: Duration,
        timeout: Duration,
    ) -> ChainResult<TransactionReceipt> {
        let start = tokio::time::Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(ChainError::NetworkUnavailable(format!(
                    "timeout waiting for receipt of {tx_hash:?}"
                )));
            }
            if let Ok(Some(receipt)) = self.get_transaction_receipt(tx_hash).await {
                return Ok(receipt);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
