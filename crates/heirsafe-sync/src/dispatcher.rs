use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use heirsafe_primitives::abi::{IHeirFactory, IHeirModule, ISafe};
use heirsafe_primitives::{prevalidated_signature, AccountRecord, DeploymentSalt, SENTINEL};
use heirsafe_rpc::{code_exposes_selector, ChainError, ChainReader};
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{SystemClock, WallClock};
use crate::error::{DispatchError, WalletError};
use crate::reconciler::Trigger;
use crate::resolver::{is_module_enabled, NetworkContext};
use crate::wallet::{TxRequest, TxSettlement, WalletCapability};

/// How a module binding removes a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveStrategy {
    /// The module exposes `removeBeneficiary()`.
    Dedicated,
    /// Older modules: `setBeneficiary(0, 0)`.
    ZeroOut,
}

impl RemoveStrategy {
    /// Picks the strategy from the module's runtime code.
    pub fn detect(code: &[u8]) -> Self {
        if code_exposes_selector(code, IHeirModule::removeBeneficiaryCall::SELECTOR) {
            Self::Dedicated
        } else {
            Self::ZeroOut
        }
    }

    fn calldata(&self) -> Vec<u8> {
        match self {
            Self::Dedicated => IHeirModule::removeBeneficiaryCall {}.abi_encode(),
            Self::ZeroOut => IHeirModule::setBeneficiaryCall {
                beneficiary: Address::ZERO,
                activationTime: U256::ZERO,
            }
            .abi_encode(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    SetBeneficiary,
    ProlongActivation,
    RemoveBeneficiary,
    ClaimSafe,
    DeployModule,
    EnableModule,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetBeneficiary => "set_beneficiary",
            Self::ProlongActivation => "prolong_activation",
            Self::RemoveBeneficiary => "remove_beneficiary",
            Self::ClaimSafe => "claim_safe",
            Self::DeployModule => "deploy_module",
            Self::EnableModule => "enable_module",
        }
    }
}

/// Progress of a submitted action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionUpdate {
    Pending { action: ActionKind, tx_hash: B256 },
    Confirmed { action: ActionKind, tx_hash: B256, block_number: u64 },
    Failed { action: ActionKind, tx_hash: Option<B256>, reason: String },
}

/// A confirmed action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action: ActionKind,
    pub tx_hash: B256,
    pub block_number: u64,
}

/// A call for the user to execute through the coordination tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInstruction {
    pub target: Address,
    pub function: String,
    pub params: Vec<String>,
    pub calldata: Bytes,
}

/// Why the install fast path was not taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InstructionReason {
    ThresholdAboveOne { threshold: u64 },
    CallerNotOwner,
}

/// Result of an install request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum InstallPlan {
    /// Submitted directly with a pre-validated signature.
    Submitted { deploy_tx: Option<B256>, enable_tx: B256 },
    /// Nothing submitted; the user executes these in order.
    Instructions {
        reason: InstructionReason,
        instructions: Vec<ContractInstruction>,
        coordination_url: Option<String>,
    },
}

/// Builds, checks and submits the mutating operations for one account on
/// one network.
///
/// Every precondition is checked against fresh chain reads before the wallet
/// is asked to sign. Whatever the outcome, a settled submission asks the
/// reconciler for a fresh pass instead of assuming the resulting state.
pub struct ActionDispatcher {
    reader: Arc<dyn ChainReader>,
    wallet: Arc<dyn WalletCapability>,
    clock: Arc<dyn WallClock>,
    context: NetworkContext,
    safe: Address,
    salt: DeploymentSalt,
    coordination_url: Option<String>,
    page_size: u64,
    max_pages: u32,
    strategies: Mutex<HashMap<Address, RemoveStrategy>>,
    updates: Option<mpsc::UnboundedSender<ActionUpdate>>,
    triggers: Option<mpsc::UnboundedSender<Trigger>>,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("context", &self.context)
            .field("safe", &self.safe)
            .finish()
    }
}

impl ActionDispatcher {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        wallet: Arc<dyn WalletCapability>,
        context: NetworkContext,
        safe: Address,
        salt: DeploymentSalt,
    ) -> Self {
        Self {
            reader,
            wallet,
            clock: Arc::new(SystemClock),
            context,
            safe,
            salt,
            coordination_url: None,
            page_size: 10,
            max_pages: 256,
            strategies: Mutex::new(HashMap::new()),
            updates: None,
            triggers: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_coordination_url(mut self, url: Option<String>) -> Self {
        self.coordination_url = url;
        self
    }

    pub fn with_paging(mut self, page_size: u64, max_pages: u32) -> Self {
        self.page_size = page_size;
        self.max_pages = max_pages;
        self
    }

    /// Action progress is reported here.
    pub fn with_updates(mut self, tx: mpsc::UnboundedSender<ActionUpdate>) -> Self {
        self.updates = Some(tx);
        self
    }

    /// Settled actions request a reconciliation pass here.
    pub fn with_triggers(mut self, tx: mpsc::UnboundedSender<Trigger>) -> Self {
        self.triggers = Some(tx);
        self
    }

    fn module(&self) -> Result<Address, DispatchError> {
        self.context
            .module
            .ok_or_else(|| DispatchError::precondition("module address has not been resolved"))
    }

    fn emit(&self, update: ActionUpdate) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(update);
        }
    }

    fn request_reconcile(&self) {
        if let Some(tx) = &self.triggers {
            if tx.send(Trigger::ActionSettled).is_err() {
                debug!("reconciler gone, skipping post-action refresh");
            }
        }
    }

    /// The wallet's account, provided the wallet is on this dispatcher's network.
    async fn connected_caller(&self) -> Result<Address, DispatchError> {
        let chain_id = self.wallet.current_chain_id().await?;
        if chain_id != self.context.chain_id {
            return Err(DispatchError::precondition(format!(
                "wallet is on network {chain_id}, expected {}",
                self.context.chain_id
            )));
        }
        self.wallet.current_account().await?.ok_or(DispatchError::Wallet(WalletError::NotConnected))
    }

    /// Caller must be `owner`, and `owner` must own the account.
    async fn require_owner_caller(&self, owner: Address) -> Result<Address, DispatchError> {
        let caller = self.connected_caller().await?;
        if caller != owner {
            return Err(DispatchError::precondition(format!(
                "caller {caller} is not owner {owner}"
            )));
        }
        let owners = self.reader.safe_owners(self.safe).await?;
        if !owners.contains(&owner) {
            return Err(DispatchError::precondition(format!(
                "{owner} is not an owner of {}",
                self.safe
            )));
        }
        Ok(caller)
    }

    async fn require_deployed(&self, module: Address) -> Result<(), DispatchError> {
        if !self.reader.has_code(module).await? {
            return Err(DispatchError::precondition(format!("module {module} is not deployed")));
        }
        Ok(())
    }

    fn require_future(&self, timestamp: u64) -> Result<(), DispatchError> {
        let now = self.clock.now_secs();
        if timestamp <= now {
            return Err(DispatchError::precondition(format!(
                "activation time {timestamp} is not after the current time {now}"
            )));
        }
        Ok(())
    }

    /// Remove strategy for `module`, detected once from its code.
    pub async fn remove_strategy(&self, module: Address) -> Result<RemoveStrategy, DispatchError> {
        if let Some(known) = self.strategies.lock().ok().and_then(|s| s.get(&module).copied()) {
            return Ok(known);
        }
        let code = self.reader.code_at(module).await?;
        if code.is_empty() {
            return Err(DispatchError::precondition(format!("module {module} is not deployed")));
        }
        let strategy = RemoveStrategy::detect(&code);
        info!(%module, ?strategy, "bound module remove strategy");
        if let Ok(mut strategies) = self.strategies.lock() {
            strategies.insert(module, strategy);
        }
        Ok(strategy)
    }

    /// Sets `beneficiary` and `activation_time` for `owner`.
    pub async fn set_beneficiary(
        &self,
        owner: Address,
        beneficiary: Address,
        activation_time: u64,
    ) -> Result<ActionOutcome, DispatchError> {
        let module = self.module()?;
        if beneficiary.is_zero() || beneficiary == SENTINEL {
            return Err(DispatchError::precondition("beneficiary must be a non-zero address"));
        }
        self.require_future(activation_time)?;
        self.require_owner_caller(owner).await?;
        self.require_deployed(module).await?;

        let data = IHeirModule::setBeneficiaryCall {
            beneficiary,
            activationTime: U256::from(activation_time),
        }
        .abi_encode();
        self.submit(ActionKind::SetBeneficiary, TxRequest::call(module, data)).await
    }

    /// Moves `owner`'s activation time to `new_activation_time`.
    pub async fn prolong_activation(
        &self,
        owner: Address,
        new_activation_time: u64,
    ) -> Result<ActionOutcome, DispatchError> {
        let module = self.module()?;
        self.require_future(new_activation_time)?;
        self.require_owner_caller(owner).await?;
        self.require_deployed(module).await?;

        let current = self.reader.read_heir_config(module, owner).await?;
        if !current.has_beneficiary() {
            return Err(DispatchError::precondition(format!("{owner} has no beneficiary configured")));
        }

        let data = IHeirModule::setActivationTimeCall { activationTime: U256::from(new_activation_time) }
            .abi_encode();
        self.submit(ActionKind::ProlongActivation, TxRequest::call(module, data)).await
    }

    /// Clears `owner`'s configuration.
    ///
    /// An owner with nothing configured is a precondition failure, so the
    /// operation never submits a no-op.
    pub async fn remove_beneficiary(&self, owner: Address) -> Result<ActionOutcome, DispatchError> {
        let module = self.module()?;
        self.require_owner_caller(owner).await?;
        self.require_deployed(module).await?;

        let current = self.reader.read_heir_config(module, owner).await?;
        if current.is_unset() {
            return Err(DispatchError::precondition(format!("{owner} has no configuration to remove")));
        }

        let strategy = self.remove_strategy(module).await?;
        self.submit(ActionKind::RemoveBeneficiary, TxRequest::call(module, strategy.calldata()))
            .await
    }

    /// Re-reads the live owner list and returns the predecessor of `owner`.
    async fn fresh_predecessor(&self, owner: Address) -> Result<Address, DispatchError> {
        let owners = self.reader.safe_owners(self.safe).await?;
        let record = AccountRecord { address: self.safe, owners, threshold: 0 };
        record
            .previous_owner(owner)
            .ok_or_else(|| DispatchError::precondition(format!("{owner} is not an owner of {}", self.safe)))
    }

    async fn dry_run(&self, from: Address, to: Address, data: &[u8]) -> Result<(), DispatchError> {
        match self.reader.simulate(from, to, Bytes::copy_from_slice(data)).await {
            Ok(_) => Ok(()),
            Err(ChainError::Reverted { reason }) => {
                warn!(%from, %to, %reason, "dry run rejected");
                Err(DispatchError::DryRunFailed { reason })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces `owner_to_replace` with the caller, who must be its configured
    /// beneficiary.
    pub async fn claim_safe(&self, owner_to_replace: Address) -> Result<ActionOutcome, DispatchError> {
        let module = self.module()?;
        let caller = self.connected_caller().await?;
        self.require_deployed(module).await?;

        let config = self.reader.read_heir_config(module, owner_to_replace).await?;
        if !config.has_beneficiary() {
            return Err(DispatchError::precondition(format!(
                "{owner_to_replace} has no beneficiary configured"
            )));
        }
        if config.beneficiary != caller {
            return Err(DispatchError::precondition(format!(
                "caller {caller} is not the beneficiary of {owner_to_replace}"
            )));
        }

        let claim = |prev: Address| {
            IHeirModule::claimSafeCall { owner: owner_to_replace, prevOwner: prev }.abi_encode()
        };

        let mut prev = self.fresh_predecessor(owner_to_replace).await?;
        self.dry_run(caller, module, &claim(prev)).await?;

        // The owner list may have changed while the dry run was in flight.
        let latest = self.fresh_predecessor(owner_to_replace).await?;
        if latest != prev {
            debug!(%owner_to_replace, old = %prev, new = %latest, "predecessor changed, repeating dry run");
            prev = latest;
            self.dry_run(caller, module, &claim(prev)).await?;
        }

        self.submit(ActionKind::ClaimSafe, TxRequest::call(module, claim(prev))).await
    }

    /// Installs the module on the account.
    ///
    /// With threshold one and an owner connected, deploys the module if needed
    /// and enables it with a pre-validated signature. Otherwise nothing is
    /// submitted and the calls are returned as instructions.
    pub async fn install(&self) -> Result<InstallPlan, DispatchError> {
        let module = self.module()?;
        let factory = self
            .context
            .factory
            .ok_or_else(|| DispatchError::precondition("no module factory configured for this network"))?;
        let caller = self.connected_caller().await?;

        let owners = self.reader.safe_owners(self.safe).await?;
        let threshold = self.reader.safe_threshold(self.safe).await?;
        let account = AccountRecord { address: self.safe, owners, threshold };

        let deployed = self.reader.has_code(module).await?;
        if deployed {
            let check = is_module_enabled(
                self.reader.as_ref(),
                self.safe,
                module,
                self.page_size,
                self.max_pages,
            )
            .await?;
            if check.enabled {
                return Err(DispatchError::precondition("module is already enabled"));
            }
        }

        let reason = if account.threshold != 1 {
            Some(InstructionReason::ThresholdAboveOne { threshold: account.threshold })
        } else if !account.is_owner(caller) {
            Some(InstructionReason::CallerNotOwner)
        } else {
            None
        };
        if let Some(reason) = reason {
            info!(safe = %self.safe, ?reason, "install requires the coordination tool");
            return Ok(InstallPlan::Instructions {
                reason,
                instructions: self.install_instructions(factory, module, deployed),
                coordination_url: self.coordination_url.clone(),
            });
        }

        let enable = self.enable_via_prevalidated_signature(caller, module);
        self.dry_run(caller, self.safe, &enable).await?;

        let deploy_tx = if deployed {
            None
        } else {
            let data = IHeirFactory::deployCall { safe: self.safe, salt: self.salt.as_b256() }.abi_encode();
            let outcome = self.submit(ActionKind::DeployModule, TxRequest::call(factory, data)).await?;
            if !self.reader.has_code(module).await? {
                return Err(ChainError::MalformedResponse(format!(
                    "factory deployment did not produce predicted module {module}"
                ))
                .into());
            }
            Some(outcome.tx_hash)
        };

        let outcome = self.submit(ActionKind::EnableModule, TxRequest::call(self.safe, enable)).await?;
        Ok(InstallPlan::Submitted { deploy_tx, enable_tx: outcome.tx_hash })
    }

    fn enable_via_prevalidated_signature(&self, owner: Address, module: Address) -> Vec<u8> {
        ISafe::execTransactionCall {
            to: self.safe,
            value: U256::ZERO,
            data: ISafe::enableModuleCall { module }.abi_encode().into(),
            operation: 0,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: prevalidated_signature(owner),
        }
        .abi_encode()
    }

    fn install_instructions(
        &self,
        factory: Address,
        module: Address,
        deployed: bool,
    ) -> Vec<ContractInstruction> {
        let mut instructions = Vec::with_capacity(2);
        if !deployed {
            instructions.push(ContractInstruction {
                target: factory,
                function: "deploy".to_string(),
                params: vec![self.safe.to_checksum(None), self.salt.to_string()],
                calldata: IHeirFactory::deployCall { safe: self.safe, salt: self.salt.as_b256() }
                    .abi_encode()
                    .into(),
            });
        }
        instructions.push(ContractInstruction {
            target: self.safe,
            function: "enableModule".to_string(),
            params: vec![module.to_checksum(None)],
            calldata: ISafe::enableModuleCall { module }.abi_encode().into(),
        });
        instructions
    }

    async fn submit(&self, action: ActionKind, tx: TxRequest) -> Result<ActionOutcome, DispatchError> {
        counter!("heirsafe_actions_submitted_total", "action" => action.as_str()).increment(1);
        let result = self.submit_and_settle(action, tx).await;
        self.request_reconcile();
        result
    }

    async fn submit_and_settle(
        &self,
        action: ActionKind,
        tx: TxRequest,
    ) -> Result<ActionOutcome, DispatchError> {
        let tx_hash = match self.wallet.send_transaction(tx).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(action = action.as_str(), error = %e, "submission failed");
                self.emit(ActionUpdate::Failed { action, tx_hash: None, reason: e.to_string() });
                return Err(e.into());
            }
        };
        info!(action = action.as_str(), %tx_hash, "transaction submitted");
        self.emit(ActionUpdate::Pending { action, tx_hash });

        match self.wallet.wait_for_settlement(tx_hash).await {
            Ok(TxSettlement::Confirmed { tx_hash, block_number }) => {
                info!(action = action.as_str(), %tx_hash, block_number, "transaction confirmed");
                self.emit(ActionUpdate::Confirmed { action, tx_hash, block_number });
                Ok(ActionOutcome { action, tx_hash, block_number })
            }
            Ok(TxSettlement::Reverted { tx_hash, reason }) => {
                let reason = reason.unwrap_or_else(|| "transaction failed".to_string());
                warn!(action = action.as_str(), %tx_hash, %reason, "transaction reverted");
                self.emit(ActionUpdate::Failed { action, tx_hash: Some(tx_hash), reason: reason.clone() });
                Err(DispatchError::Reverted { tx_hash, reason })
            }
            Err(e) => {
                self.emit(ActionUpdate::Failed { action, tx_hash: Some(tx_hash), reason: e.to_string() });
                Err(e.into())
            }
        }
    }
}
