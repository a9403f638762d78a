use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use heirsafe_primitives::abi::{IHeirFactory, IHeirModule, ISafe};
use heirsafe_primitives::HeirConfig;
use tracing::debug;

use crate::client::{CallRequest, RpcClient};
use crate::error::{ChainError, ChainResult};

/// One page of an account's enabled-module list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModulePage {
    pub modules: Vec<Address>,
    /// Cursor for the next page; the sentinel once the list is exhausted.
    pub next: Address,
}

/// Read-only access to the active network.
///
/// Every query is idempotent and side-effect free. Implementations do not
/// retry; retry policy belongs to the caller.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Chain id of the endpoint the reader is bound to.
    async fn chain_id(&self) -> ChainResult<u64>;

    /// Runtime code at `address`.
    async fn code_at(&self, address: Address) -> ChainResult<Bytes>;

    async fn has_code(&self, address: Address) -> ChainResult<bool> {
        Ok(!self.code_at(address).await?.is_empty())
    }

    /// The module's stored configuration for `owner`.
    async fn read_heir_config(&self, module: Address, owner: Address) -> ChainResult<HeirConfig>;

    /// Timestamp of the latest confirmed block, in seconds.
    async fn latest_confirmed_timestamp(&self) -> ChainResult<u64>;

    /// Owners of a multi-signature account, in list order.
    async fn safe_owners(&self, safe: Address) -> ChainResult<Vec<Address>>;

    async fn safe_threshold(&self, safe: Address) -> ChainResult<u64>;

    async fn modules_page(
        &self,
        safe: Address,
        start: Address,
        page_size: u64,
    ) -> ChainResult<ModulePage>;

    /// The factory's own answer for the module address of `safe`.
    async fn predict_module(
        &self,
        factory: Address,
        safe: Address,
        salt: B256,
    ) -> ChainResult<Address>;

    /// Executes a call without committing it. A revert is reported as
    /// [`ChainError::Reverted`].
    async fn simulate(&self, from: Address, to: Address, data: Bytes) -> ChainResult<Bytes>;
}

/// Whether `code` contains `selector` as a `PUSH4` immediate.
///
/// Solidity dispatchers compare the call selector against `PUSH4` constants,
/// so a function the contract exposes shows up this way. `PUSHn` immediates
/// are skipped so data bytes are never read as opcodes.
pub fn code_exposes_selector(code: &[u8], selector: [u8; 4]) -> bool {
    const PUSH1: u8 = 0x60;
    const PUSH4: u8 = 0x63;
    const PUSH32: u8 = 0x7f;

    let mut pc = 0usize;
    while pc < code.len() {
        let op = code[pc];
        if op == PUSH4 && code.get(pc + 1..pc + 5) == Some(&selector[..]) {
            return true;
        }
        pc += 1;
        if (PUSH1..=PUSH32).contains(&op) {
            pc += (op - PUSH1 + 1) as usize;
        }
    }
    false
}

fn to_u64(value: U256, what: &str) -> ChainResult<u64> {
    u64::try_from(value).map_err(|_| ChainError::MalformedResponse(format!("{what} out of range: {value}")))
}

/// [`ChainReader`] over a JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcChainReader {
    rpc: RpcClient,
}

impl RpcChainReader {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// `eth_call` whose empty result means the target lacks the interface.
    async fn view(&self, to: Address, data: Vec<u8>) -> ChainResult<Bytes> {
        let out = self.rpc.eth_call(&CallRequest::new(to, data)).await?;
        if out.is_empty() {
            return Err(ChainError::MalformedResponse(format!("{to} returned no data")));
        }
        Ok(out)
    }
}

fn decode_err(what: &str) -> impl FnOnce(alloy_sol_types::Error) -> ChainError + '_ {
    move |e| ChainError::MalformedResponse(format!("cannot decode {what}: {e}"))
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn chain_id(&self) -> ChainResult<u64> {
        self.rpc.chain_id().await
    }

    async fn code_at(&self, address: Address) -> ChainResult<Bytes> {
        self.rpc.get_code(address).await
    }

    async fn read_heir_config(&self, module: Address, owner: Address) -> ChainResult<HeirConfig> {
        let out = self.view(module, IHeirModule::heirConfigsCall { owner }.abi_encode()).await?;
        let ret = IHeirModule::heirConfigsCall::abi_decode_returns(&out)
            .map_err(decode_err("heirConfigs"))?;
        Ok(HeirConfig {
            owner,
            beneficiary: ret.beneficiary,
            activation_time: to_u64(ret.activationTime, "activation time")?,
        })
    }

    async fn latest_confirmed_timestamp(&self) -> ChainResult<u64> {
        let header = self.rpc.latest_block().await?;
        debug!(block = header.number, timestamp = header.timestamp, "latest block");
        Ok(header.timestamp)
    }

    async fn safe_owners(&self, safe: Address) -> ChainResult<Vec<Address>> {
        let out = self.view(safe, ISafe::getOwnersCall {}.abi_encode()).await?;
        ISafe::getOwnersCall::abi_decode_returns(&out).map_err(decode_err("getOwners"))
    }

    async fn safe_threshold(&self, safe: Address) -> ChainResult<u64> {
        let out = self.view(safe, ISafe::getThresholdCall {}.abi_encode()).await?;
        let threshold =
            ISafe::getThresholdCall::abi_decode_returns(&out).map_err(decode_err("getThreshold"))?;
        to_u64(threshold, "threshold")
    }

    async fn modules_page(
        &self,
        safe: Address,
        start: Address,
        page_size: u64,
    ) -> ChainResult<ModulePage> {
        let call = ISafe::getModulesPaginatedCall { start, pageSize: U256::from(page_size) };
        let out = self.view(safe, call.abi_encode()).await?;
        let ret = ISafe::getModulesPaginatedCall::abi_decode_returns(&out)
            .map_err(decode_err("getModulesPaginated"))?;
        Ok(ModulePage { modules: ret.array, next: ret.next })
    }

    async fn predict_module(
        &self,
        factory: Address,
        safe: Address,
        salt: B256,
    ) -> ChainResult<Address> {
        let out = self.view(factory, IHeirFactory::predictCall { safe, salt }.abi_encode()).await?;
        IHeirFactory::predictCall::abi_decode_returns(&out).map_err(decode_err("predict"))
    }

    async fn simulate(&self, from: Address, to: Address, data: Bytes) -> ChainResult<Bytes> {
        self.rpc.eth_call(&CallRequest::new(to, data).with_from(from)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECTOR: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    #[test]
    fn test_selector_found_in_dispatcher() {
        // PUSH1 0xe0 CALLDATALOAD ... DUP1 PUSH4 <selector> EQ
        let code = [0x60, 0xe0, 0x35, 0x80, 0x63, 0x12, 0x34, 0x56, 0x78, 0x14];
        assert!(code_exposes_selector(&code, SELECTOR));
    }

    #[test]
    fn test_selector_inside_push_data_ignored() {
        // PUSH32 whose immediate happens to contain 0x63 <selector>.
        let mut code = vec![0x7f];
        let mut imm = [0u8; 32];
        imm[3..8].copy_from_slice(&[0x63, 0x12, 0x34, 0x56, 0x78]);
        code.extend_from_slice(&imm);
        code.push(0x00);
        assert!(!code_exposes_selector(&code, SELECTOR));
    }

    #[test]
    fn test_truncated_push4_at_end() {
        let code = [0x63, 0x12, 0x34];
        assert!(!code_exposes_selector(&code, SELECTOR));
        assert!(!code_exposes_selector(&[], SELECTOR));
    }

    #[test]
    fn test_remove_selector_constant() {
        assert_eq!(
            IHeirModule::removeBeneficiaryCall::SELECTOR,
            alloy_primitives::keccak256("removeBeneficiary()")[..4]
        );
    }
}
