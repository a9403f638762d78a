use alloy_primitives::Address;
use heirsafe_chainspec::{ConfigError, NetworkConfig};
use heirsafe_primitives::{
    parse_account_address, AccountRecord, DeploymentSalt, HeirConfig, ModuleInstallationState,
    SENTINEL,
};
use heirsafe_rpc::{AddressPredictor, ChainError, ChainReader, ChainResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ResolveError;

/// The active network as seen by one reconciliation pass.
///
/// Replaced wholesale whenever the network changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub factory: Option<Address>,
    /// Predicted module for the selected account, once known.
    pub module: Option<Address>,
}

impl NetworkContext {
    pub fn new(chain_id: u64, factory: Option<Address>) -> Self {
        Self { chain_id, factory, module: None }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.chain_id, config.factory)
    }

    /// A copy carrying the predicted module address.
    pub fn with_module(&self, module: Address) -> Self {
        Self { module: Some(module), ..self.clone() }
    }
}

/// Answer of one resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedModule {
    pub context: NetworkContext,
    pub account: AccountRecord,
    pub installation: ModuleInstallationState,
    pub module: Address,
    /// One row per owner, in the account's owner order.
    pub heirs: Vec<HeirConfig>,
    /// Owners whose row fell back to a prior value or zeros.
    pub degraded: Vec<Address>,
}

/// Result of an enabled-module traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnabledCheck {
    pub enabled: bool,
    /// Pages fetched.
    pub pages: u32,
    /// The page cap was hit before the list ended.
    pub truncated: bool,
}

/// Whether `module` is in `safe`'s enabled-module list.
///
/// Walks the list from the sentinel cursor. Ends when the module is found, a
/// page is empty, or the cursor returns to the sentinel; `max_pages` bounds
/// the walk in case a broken list never does.
pub async fn is_module_enabled(
    reader: &dyn ChainReader,
    safe: Address,
    module: Address,
    page_size: u64,
    max_pages: u32,
) -> ChainResult<EnabledCheck> {
    let mut cursor = SENTINEL;
    let mut pages = 0u32;

    loop {
        if pages >= max_pages {
            warn!(%safe, pages, "module list did not terminate within page cap");
            return Ok(EnabledCheck { enabled: false, pages, truncated: true });
        }

        let page = reader.modules_page(safe, cursor, page_size).await?;
        pages += 1;

        if page.modules.contains(&module) {
            return Ok(EnabledCheck { enabled: true, pages, truncated: false });
        }
        if page.modules.is_empty() || page.next == SENTINEL || page.next.is_zero() || page.next == cursor {
            return Ok(EnabledCheck { enabled: false, pages, truncated: false });
        }
        cursor = page.next;
    }
}

/// Reads account ownership and module state for one network.
///
/// Holds the address predictor, so a resolver lives exactly as long as the
/// network context it was built for.
pub struct ModuleStateResolver {
    reader: Arc<dyn ChainReader>,
    predictor: AddressPredictor,
    salt: DeploymentSalt,
    page_size: u64,
    max_pages: u32,
}

impl std::fmt::Debug for ModuleStateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStateResolver")
            .field("salt", &self.salt)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

impl ModuleStateResolver {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        salt: DeploymentSalt,
        page_size: u64,
        max_pages: u32,
    ) -> Self {
        let predictor = AddressPredictor::new(reader.clone());
        Self { reader, predictor, salt, page_size, max_pages }
    }

    pub fn reader(&self) -> &Arc<dyn ChainReader> {
        &self.reader
    }

    pub fn salt(&self) -> &DeploymentSalt {
        &self.salt
    }

    /// Reads the owner list and threshold, rejecting anything that is not a
    /// multi-signature account.
    pub async fn read_account(&self, safe: Address) -> Result<AccountRecord, ResolveError> {
        let not_safe = |reason: String| ResolveError::NotASafeAccount { address: safe, reason };

        let owners = match self.reader.safe_owners(safe).await {
            Ok(owners) => owners,
            Err(ChainError::MalformedResponse(reason)) | Err(ChainError::Reverted { reason }) => {
                return Err(not_safe(reason))
            }
            Err(e) => return Err(e.into()),
        };
        if owners.is_empty() {
            return Err(not_safe("account has no owners".into()));
        }

        let threshold = match self.reader.safe_threshold(safe).await {
            Ok(t) => t,
            Err(ChainError::MalformedResponse(reason)) | Err(ChainError::Reverted { reason }) => {
                return Err(not_safe(reason))
            }
            Err(e) => return Err(e.into()),
        };
        if threshold == 0 {
            return Err(not_safe("threshold is zero".into()));
        }

        Ok(AccountRecord { address: safe, owners, threshold })
    }

    /// Predicted module address for `safe` on this network.
    pub async fn predict(&self, context: &NetworkContext, safe: Address) -> Result<Address, ResolveError> {
        let factory = context
            .factory
            .ok_or(ConfigError::MissingFactory { chain_id: context.chain_id })?;
        self.predictor.predict(factory, safe, &self.salt).await.map_err(|e| match e {
            ChainError::FactoryUnreachable { factory } => {
                ResolveError::FactoryNotDeployed { chain_id: context.chain_id, factory }
            }
            other => other.into(),
        })
    }

    /// Installation state of `module` for `safe`.
    pub async fn installation(
        &self,
        safe: Address,
        module: Address,
    ) -> ChainResult<ModuleInstallationState> {
        if !self.reader.has_code(module).await? {
            return Ok(ModuleInstallationState::NotDeployed);
        }
        let check = is_module_enabled(self.reader.as_ref(), safe, module, self.page_size, self.max_pages)
            .await?;
        Ok(if check.enabled {
            ModuleInstallationState::Enabled
        } else {
            ModuleInstallationState::DeployedNotEnabled
        })
    }

    /// Full resolution for a user-supplied account address.
    ///
    /// `prior` holds rows from an earlier pass over the same account and
    /// network; a row whose read fails falls back to its prior value, or to
    /// zeros on first load.
    pub async fn resolve(
        &self,
        context: &NetworkContext,
        account: &str,
        prior: &[HeirConfig],
    ) -> Result<ResolvedModule, ResolveError> {
        let safe = parse_account_address(account)?;
        let record = self.read_account(safe).await?;
        let module = self.predict(context, safe).await?;

        if !self.reader.has_code(module).await? {
            debug!(%safe, %module, "module not deployed");
            return Ok(ResolvedModule {
                context: context.with_module(module),
                heirs: record.owners.iter().copied().map(HeirConfig::unset).collect(),
                account: record,
                installation: ModuleInstallationState::NotDeployed,
                module,
                degraded: Vec::new(),
            });
        }

        let check = is_module_enabled(self.reader.as_ref(), safe, module, self.page_size, self.max_pages)
            .await?;
        let installation = if check.enabled {
            ModuleInstallationState::Enabled
        } else {
            ModuleInstallationState::DeployedNotEnabled
        };

        let mut heirs = Vec::with_capacity(record.owners.len());
        let mut degraded = Vec::new();
        for owner in &record.owners {
            match self.reader.read_heir_config(module, *owner).await {
                Ok(config) => heirs.push(config),
                Err(e) => {
                    warn!(%owner, %module, error = %e, "heir config read failed, keeping prior row");
                    let fallback = prior
                        .iter()
                        .find(|row| row.owner == *owner)
                        .copied()
                        .unwrap_or_else(|| HeirConfig::unset(*owner));
                    heirs.push(fallback);
                    degraded.push(*owner);
                }
            }
        }

        info!(
            %safe,
            %module,
            chain_id = context.chain_id,
            %installation,
            owners = record.owners.len(),
            degraded = degraded.len(),
            "resolved module state"
        );

        Ok(ResolvedModule {
            context: context.with_module(module),
            account: record,
            installation,
            module,
            heirs,
            degraded,
        })
    }
}
