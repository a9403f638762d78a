//! In-memory chain and wallet shared by the integration suites.
//!
//! `MockChain` models the factory, the heir module and the multi-signature
//! account closely enough to exercise every read and write the client issues:
//! deterministic address prediction, the paginated module list with the
//! account's cursor semantics, pre-validated signatures and claim ordering.
//! `MockWallet` signs nothing; it applies submitted calls to the chain of the
//! network it is currently on.

#![allow(dead_code)]

use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_sol_types::{SolCall, SolValue};
use async_trait::async_trait;
use heirsafe_chainspec::NetworkConfig;
use heirsafe_primitives::abi::{IHeirFactory, IHeirModule, ISafe};
use heirsafe_primitives::{DeploymentSalt, HeirConfig, SENTINEL};
use heirsafe_rpc::{ChainError, ChainReader, ChainResult, ModulePage};
use heirsafe_sync::{
    ReaderProvider, TxRequest, TxSettlement, WalletCapability, WalletError, WalletEvent,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

pub const FACTORY: Address = Address::repeat_byte(0xFA);
pub const BEEF: Address = Address::repeat_byte(0xBE);

pub fn salt() -> DeploymentSalt {
    DeploymentSalt::new(B256::repeat_byte(0x42))
}

pub fn owner(n: u8) -> Address {
    Address::with_last_byte(0x10 + n)
}

pub fn safe_address(n: u8) -> Address {
    Address::with_last_byte(0xA0 + n)
}

/// Runtime code exposing the given selectors as `PUSH4 <sel> EQ` dispatch entries.
pub fn dispatch_code(selectors: &[[u8; 4]]) -> Bytes {
    let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x52, 0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c];
    for selector in selectors {
        code.push(0x80);
        code.push(0x63);
        code.extend_from_slice(selector);
        code.push(0x14);
    }
    code.push(0x00);
    code.into()
}

pub fn module_code(dedicated_remove: bool) -> Bytes {
    let mut selectors = vec![
        IHeirModule::heirConfigsCall::SELECTOR,
        IHeirModule::setBeneficiaryCall::SELECTOR,
        IHeirModule::setActivationTimeCall::SELECTOR,
        IHeirModule::claimSafeCall::SELECTOR,
    ];
    if dedicated_remove {
        selectors.push(IHeirModule::removeBeneficiaryCall::SELECTOR);
    }
    dispatch_code(&selectors)
}

#[derive(Clone, Debug, Default)]
pub struct SafeState {
    pub owners: Vec<Address>,
    pub threshold: u64,
    /// Enabled modules, head of the account's linked list first.
    pub modules: Vec<Address>,
}

#[derive(Debug, Default)]
struct ChainState {
    chain_id: u64,
    timestamp: u64,
    block: u64,
    code: HashMap<Address, Bytes>,
    safes: HashMap<Address, SafeState>,
    /// Module address to the account it was deployed for.
    module_safe: HashMap<Address, Address>,
    heirs: HashMap<(Address, Address), (Address, u64)>,
    /// Owner list swapped in after the next dry run.
    owners_after_simulate: Option<(Address, Vec<Address>)>,
}

/// Pauses heir config reads until released.
#[derive(Clone, Default)]
pub struct ReadGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct MockChain {
    state: Mutex<ChainState>,
    module_code: Bytes,
    offline: AtomicBool,
    failing_owners: Mutex<HashSet<Address>>,
    gate: Mutex<Option<ReadGate>>,
    endless_module_list: AtomicBool,
    pub module_page_calls: AtomicU32,
    pub heir_reads: AtomicU32,
    pub timestamp_reads: AtomicU32,
}

impl MockChain {
    pub fn new(chain_id: u64, timestamp: u64) -> Self {
        Self::with_module_code(chain_id, timestamp, module_code(true))
    }

    /// A chain whose factory deploys `code` as the module.
    pub fn with_module_code(chain_id: u64, timestamp: u64, code: Bytes) -> Self {
        let mut state = ChainState { chain_id, timestamp, block: 1, ..Default::default() };
        state.code.insert(
            FACTORY,
            dispatch_code(&[IHeirFactory::predictCall::SELECTOR, IHeirFactory::deployCall::SELECTOR]),
        );
        Self {
            state: Mutex::new(state),
            module_code: code,
            offline: AtomicBool::new(false),
            failing_owners: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            endless_module_list: AtomicBool::new(false),
            module_page_calls: AtomicU32::new(0),
            heir_reads: AtomicU32::new(0),
            timestamp_reads: AtomicU32::new(0),
        }
    }

    pub fn without_factory(self) -> Self {
        self.state.lock().unwrap().code.remove(&FACTORY);
        self
    }

    /// The module address the factory derives for `safe`.
    pub fn predicted(safe: Address, salt: &DeploymentSalt) -> Address {
        let digest = keccak256([FACTORY.as_slice(), safe.as_slice(), salt.as_b256().as_slice()].concat());
        Address::from_slice(&digest[12..])
    }

    pub fn add_safe(&self, safe: Address, owners: Vec<Address>, threshold: u64) {
        let mut state = self.state.lock().unwrap();
        state.code.insert(safe, dispatch_code(&[ISafe::getOwnersCall::SELECTOR]));
        state.safes.insert(safe, SafeState { owners, threshold, modules: Vec::new() });
    }

    /// Puts code at `address` without making it a module.
    pub fn add_contract(&self, address: Address) {
        self.state.lock().unwrap().code.insert(address, dispatch_code(&[[0xde, 0xad, 0xbe, 0xef]]));
    }

    /// Deploys the module for `safe` as the factory would.
    pub fn deploy_module(&self, safe: Address, salt: &DeploymentSalt) -> Address {
        let module = Self::predicted(safe, salt);
        let mut state = self.state.lock().unwrap();
        state.code.insert(module, self.module_code.clone());
        state.module_safe.insert(module, safe);
        module
    }

    pub fn enable_module(&self, safe: Address, module: Address) {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.safes.get_mut(&safe) {
            s.modules.insert(0, module);
        }
    }

    /// Adds unrelated modules to `safe`'s list.
    pub fn add_other_modules(&self, safe: Address, count: u8) {
        for i in 0..count {
            let mut bytes = [0x77u8; 20];
            bytes[19] = i;
            self.enable_module(safe, Address::from(bytes));
        }
    }

    pub fn set_heir(&self, module: Address, owner: Address, beneficiary: Address, activation: u64) {
        self.state.lock().unwrap().heirs.insert((module, owner), (beneficiary, activation));
    }

    pub fn heir(&self, module: Address, owner: Address) -> Option<(Address, u64)> {
        self.state.lock().unwrap().heirs.get(&(module, owner)).copied()
    }

    pub fn safe(&self, safe: Address) -> SafeState {
        self.state.lock().unwrap().safes.get(&safe).cloned().unwrap_or_default()
    }

    pub fn set_owners(&self, safe: Address, owners: Vec<Address>) {
        if let Some(s) = self.state.lock().unwrap().safes.get_mut(&safe) {
            s.owners = owners;
        }
    }

    pub fn set_owners_after_next_simulate(&self, safe: Address, owners: Vec<Address>) {
        self.state.lock().unwrap().owners_after_simulate = Some((safe, owners));
    }

    pub fn set_timestamp(&self, timestamp: u64) {
        self.state.lock().unwrap().timestamp = timestamp;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_heir_reads_for(&self, owner: Address) {
        self.failing_owners.lock().unwrap().insert(owner);
    }

    pub fn clear_failures(&self) {
        self.failing_owners.lock().unwrap().clear();
    }

    /// Every subsequent heir config read waits on the returned gate.
    pub fn hold_heir_reads(&self) -> ReadGate {
        let gate = ReadGate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release_heir_reads(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.release.notify_waiters();
        }
    }

    /// Module list whose cursor never returns to the sentinel.
    pub fn break_module_list(&self) {
        self.endless_module_list.store(true, Ordering::SeqCst);
    }

    fn check_online(&self) -> ChainResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChainError::NetworkUnavailable("connection refused".into()));
        }
        Ok(())
    }

    /// Executes a call from `from`. With `apply` false nothing is changed.
    pub fn execute(&self, from: Address, to: Address, data: &[u8], apply: bool) -> Result<Bytes, String> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        if to == FACTORY {
            let call = IHeirFactory::deployCall::abi_decode(data).map_err(|e| e.to_string())?;
            let module = Self::predicted(call.safe, &DeploymentSalt::new(call.salt));
            if state.code.contains_key(&module) {
                return Err("module already deployed".into());
            }
            if apply {
                state.code.insert(module, self.module_code.clone());
                state.module_safe.insert(module, call.safe);
            }
            return Ok(module.abi_encode().into());
        }

        if let Some(account) = state.safes.get_mut(&to) {
            let call = ISafe::execTransactionCall::abi_decode(data).map_err(|e| e.to_string())?;
            let sig = &call.signatures;
            if sig.len() != 65 || sig[64] != 1 {
                return Err("GS026".into());
            }
            let signer = Address::from_slice(&sig[12..32]);
            if signer != from {
                return Err("GS025".into());
            }
            if !account.owners.contains(&signer) {
                return Err("GS026".into());
            }
            if account.threshold != 1 {
                return Err("GS020".into());
            }
            if call.to != to {
                return Err("unexpected inner call target".into());
            }
            let inner = ISafe::enableModuleCall::abi_decode(&call.data).map_err(|e| e.to_string())?;
            if inner.module.is_zero() || inner.module == SENTINEL {
                return Err("GS101".into());
            }
            if account.modules.contains(&inner.module) {
                return Err("GS102".into());
            }
            if apply {
                account.modules.insert(0, inner.module);
            }
            return Ok(true.abi_encode().into());
        }

        let Some(&safe) = state.module_safe.get(&to) else {
            return Err("call to an address without a known contract".into());
        };
        let owners = state.safes.get(&safe).map(|s| s.owners.clone()).unwrap_or_default();
        let selector: [u8; 4] = data.get(..4).and_then(|s| s.try_into().ok()).unwrap_or_default();

        match selector {
            IHeirModule::setBeneficiaryCall::SELECTOR => {
                let call = IHeirModule::setBeneficiaryCall::abi_decode(data).map_err(|e| e.to_string())?;
                if !owners.contains(&from) {
                    return Err("caller is not an owner".into());
                }
                let activation = call.activationTime.to::<u64>();
                if call.beneficiary.is_zero() && activation == 0 {
                    if apply {
                        state.heirs.remove(&(to, from));
                    }
                } else {
                    if call.beneficiary.is_zero() {
                        return Err("invalid beneficiary".into());
                    }
                    if activation <= state.timestamp {
                        return Err("activation time must be in the future".into());
                    }
                    if apply {
                        state.heirs.insert((to, from), (call.beneficiary, activation));
                    }
                }
            }
            IHeirModule::setActivationTimeCall::SELECTOR => {
                let call = IHeirModule::setActivationTimeCall::abi_decode(data).map_err(|e| e.to_string())?;
                let activation = call.activationTime.to::<u64>();
                let Some(entry) = state.heirs.get_mut(&(to, from)) else {
                    return Err("no beneficiary set".into());
                };
                if activation <= state.timestamp {
                    return Err("activation time must be in the future".into());
                }
                if apply {
                    entry.1 = activation;
                }
            }
            IHeirModule::removeBeneficiaryCall::SELECTOR => {
                if self.module_code.windows(4).all(|w| w != IHeirModule::removeBeneficiaryCall::SELECTOR) {
                    return Err("unknown function".into());
                }
                if !state.heirs.contains_key(&(to, from)) {
                    return Err("no beneficiary set".into());
                }
                if apply {
                    state.heirs.remove(&(to, from));
                }
            }
            IHeirModule::claimSafeCall::SELECTOR => {
                let call = IHeirModule::claimSafeCall::abi_decode(data).map_err(|e| e.to_string())?;
                let enabled = state.safes.get(&safe).is_some_and(|s| s.modules.contains(&to));
                if !enabled {
                    return Err("GS104".into());
                }
                let Some(&(beneficiary, activation)) = state.heirs.get(&(to, call.owner)) else {
                    return Err("no beneficiary set".into());
                };
                if beneficiary != from {
                    return Err("caller is not the beneficiary".into());
                }
                if activation == 0 || state.timestamp < activation {
                    return Err("activation time not reached".into());
                }
                let Some(index) = owners.iter().position(|o| *o == call.owner) else {
                    return Err("GS205".into());
                };
                let expected_prev = if index == 0 { SENTINEL } else { owners[index - 1] };
                if call.prevOwner != expected_prev {
                    return Err("GS205".into());
                }
                if apply {
                    if let Some(s) = state.safes.get_mut(&safe) {
                        s.owners[index] = from;
                    }
                    state.heirs.remove(&(to, call.owner));
                }
            }
            _ => return Err("unknown function".into()),
        }
        Ok(Bytes::new())
    }

    fn mine(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.block += 1;
        state.block
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn chain_id(&self) -> ChainResult<u64> {
        self.check_online()?;
        Ok(self.state.lock().unwrap().chain_id)
    }

    async fn code_at(&self, address: Address) -> ChainResult<Bytes> {
        self.check_online()?;
        Ok(self.state.lock().unwrap().code.get(&address).cloned().unwrap_or_default())
    }

    async fn read_heir_config(&self, module: Address, owner: Address) -> ChainResult<HeirConfig> {
        self.heir_reads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let released = gate.release.notified();
            gate.entered.notify_one();
            released.await;
        }
        self.check_online()?;
        if self.failing_owners.lock().unwrap().contains(&owner) {
            return Err(ChainError::NetworkUnavailable("read timed out".into()));
        }
        let state = self.state.lock().unwrap();
        if !state.code.contains_key(&module) {
            return Err(ChainError::MalformedResponse("execution returned no data".into()));
        }
        let (beneficiary, activation_time) = state.heirs.get(&(module, owner)).copied().unwrap_or_default();
        Ok(HeirConfig { owner, beneficiary, activation_time })
    }

    async fn latest_confirmed_timestamp(&self) -> ChainResult<u64> {
        self.check_online()?;
        self.timestamp_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().timestamp)
    }

    async fn safe_owners(&self, safe: Address) -> ChainResult<Vec<Address>> {
        self.check_online()?;
        self.state
            .lock()
            .unwrap()
            .safes
            .get(&safe)
            .map(|s| s.owners.clone())
            .ok_or_else(|| ChainError::MalformedResponse("execution returned no data".into()))
    }

    async fn safe_threshold(&self, safe: Address) -> ChainResult<u64> {
        self.check_online()?;
        self.state
            .lock()
            .unwrap()
            .safes
            .get(&safe)
            .map(|s| s.threshold)
            .ok_or_else(|| ChainError::MalformedResponse("execution returned no data".into()))
    }

    async fn modules_page(&self, safe: Address, start: Address, page_size: u64) -> ChainResult<ModulePage> {
        self.check_online()?;
        let calls = self.module_page_calls.fetch_add(1, Ordering::SeqCst);

        if self.endless_module_list.load(Ordering::SeqCst) {
            let module = Address::from_word(keccak256(calls.to_be_bytes()));
            return Ok(ModulePage { modules: vec![module], next: module });
        }

        let state = self.state.lock().unwrap();
        let Some(account) = state.safes.get(&safe) else {
            return Err(ChainError::MalformedResponse("execution returned no data".into()));
        };

        let begin = if start == SENTINEL {
            0
        } else {
            match account.modules.iter().position(|m| *m == start) {
                Some(i) => i + 1,
                None => return Err(ChainError::Reverted { reason: "GS105".into() }),
            }
        };
        let end = (begin + page_size as usize).min(account.modules.len());
        let modules = account.modules[begin..end].to_vec();
        let next = if end < account.modules.len() { modules[modules.len() - 1] } else { SENTINEL };
        Ok(ModulePage { modules, next })
    }

    async fn predict_module(&self, factory: Address, safe: Address, salt: B256) -> ChainResult<Address> {
        self.check_online()?;
        if factory != FACTORY || !self.state.lock().unwrap().code.contains_key(&FACTORY) {
            return Err(ChainError::MalformedResponse("execution returned no data".into()));
        }
        Ok(Self::predicted(safe, &DeploymentSalt::new(salt)))
    }

    async fn simulate(&self, from: Address, to: Address, data: Bytes) -> ChainResult<Bytes> {
        self.check_online()?;
        let result = self.execute(from, to, &data, false).map_err(|reason| ChainError::Reverted { reason });
        let swap = self.state.lock().unwrap().owners_after_simulate.take();
        if let Some((safe, owners)) = swap {
            self.set_owners(safe, owners);
        }
        result
    }
}

/// Provides readers for the chains a test registers.
#[derive(Default)]
pub struct MockProvider {
    chains: HashMap<u64, Arc<MockChain>>,
}

impl MockProvider {
    pub fn with(mut self, chain_id: u64, chain: Arc<MockChain>) -> Self {
        self.chains.insert(chain_id, chain);
        self
    }
}

impl ReaderProvider for MockProvider {
    fn reader_for(&self, network: &NetworkConfig) -> Option<Arc<dyn ChainReader>> {
        self.chains.get(&network.chain_id).map(|c| c.clone() as Arc<dyn ChainReader>)
    }
}

/// Wallet that applies calls straight to the mock chain of its network.
pub struct MockWallet {
    chains: HashMap<u64, Arc<MockChain>>,
    chain_id: AtomicU64,
    account: Mutex<Option<Address>>,
    events: broadcast::Sender<WalletEvent>,
    settlements: Mutex<HashMap<B256, TxSettlement>>,
    nonce: AtomicU64,
    reject_next: AtomicBool,
    pub sent: Mutex<Vec<TxRequest>>,
}

impl MockWallet {
    pub fn new(chain_id: u64, chain: Arc<MockChain>, account: Option<Address>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            chains: HashMap::from([(chain_id, chain)]),
            chain_id: AtomicU64::new(chain_id),
            account: Mutex::new(account),
            events,
            settlements: Mutex::new(HashMap::new()),
            nonce: AtomicU64::new(0),
            reject_next: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chain(mut self, chain_id: u64, chain: Arc<MockChain>) -> Self {
        self.chains.insert(chain_id, chain);
        self
    }

    pub fn connect(&self, account: Option<Address>) {
        *self.account.lock().unwrap() = account;
        let _ = self.events.send(WalletEvent::AccountChanged(account));
    }

    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn chain(&self) -> Result<Arc<MockChain>, WalletError> {
        let chain_id = self.chain_id.load(Ordering::SeqCst);
        self.chains.get(&chain_id).cloned().ok_or(WalletError::UnsupportedNetwork(chain_id))
    }
}

#[async_trait]
impl WalletCapability for MockWallet {
    async fn current_account(&self) -> Result<Option<Address>, WalletError> {
        Ok(*self.account.lock().unwrap())
    }

    async fn current_chain_id(&self) -> Result<u64, WalletError> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn switch_network(&self, chain_id: u64) -> Result<(), WalletError> {
        if !self.chains.contains_key(&chain_id) {
            return Err(WalletError::UnsupportedNetwork(chain_id));
        }
        self.chain_id.store(chain_id, Ordering::SeqCst);
        let _ = self.events.send(WalletEvent::NetworkChanged(chain_id));
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, WalletError> {
        let from = self.account.lock().unwrap().ok_or(WalletError::NotConnected)?;
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(WalletError::Rejected("user denied transaction signature".into()));
        }
        let chain = self.chain()?;
        self.sent.lock().unwrap().push(tx.clone());

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let tx_hash = keccak256([from.as_slice(), &nonce.to_be_bytes(), &tx.data].concat());
        let settlement = match chain.execute(from, tx.to, &tx.data, true) {
            Ok(_) => TxSettlement::Confirmed { tx_hash, block_number: chain.mine() },
            Err(reason) => {
                chain.mine();
                TxSettlement::Reverted { tx_hash, reason: Some(reason) }
            }
        };
        self.settlements.lock().unwrap().insert(tx_hash, settlement);
        Ok(tx_hash)
    }

    async fn wait_for_settlement(&self, tx_hash: B256) -> Result<TxSettlement, WalletError> {
        self.settlements
            .lock()
            .unwrap()
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| WalletError::Transport(format!("unknown transaction {tx_hash}")))
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}
