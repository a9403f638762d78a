use alloy_primitives::Address;
use heirsafe_primitives::{DeploymentSalt, SaltError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Configuration errors. All of them are fatal to the current flow.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed salt: {0}")]
    Salt(#[from] SaltError),

    #[error("no salt configured (set `salt` in the config file or HEIRSAFE_SALT)")]
    MissingSalt,

    #[error("network {chain_id} is not in the network table")]
    UnknownNetwork { chain_id: u64 },

    #[error("no factory address configured for network {chain_id}")]
    MissingFactory { chain_id: u64 },

    #[error("factory address for network {chain_id} must not be zero")]
    ZeroFactory { chain_id: u64 },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Native currency descriptor for wallet onboarding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Parameters a wallet needs to add the network (EIP-3085 shape).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNetworkParams {
    pub chain_name: String,
    pub native_currency: NativeCurrency,
    pub rpc_urls: Vec<String>,
    pub block_explorer_urls: Vec<String>,
}

impl AddNetworkParams {
    /// Hex chain id as wallets expect it.
    pub fn chain_id_hex(chain_id: u64) -> String {
        format!("0x{chain_id:x}")
    }
}

/// Static per-network entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub chain_id: u64,
    /// Module factory. `None` means the client cannot operate on this network.
    pub factory: Option<Address>,
    /// Approval-coordination service for multi-signer accounts.
    pub coordination_url: Option<String>,
    pub add_network: AddNetworkParams,
}

impl NetworkConfig {
    /// The configured factory, or the configuration error explaining its absence.
    pub fn require_factory(&self) -> Result<Address, ConfigError> {
        match self.factory {
            None => Err(ConfigError::MissingFactory { chain_id: self.chain_id }),
            Some(f) if f.is_zero() => Err(ConfigError::ZeroFactory { chain_id: self.chain_id }),
            Some(f) => Ok(f),
        }
    }

    /// First RPC URL advertised for the network.
    pub fn rpc_url(&self) -> Option<&str> {
        self.add_network.rpc_urls.first().map(String::as_str)
    }
}

/// Override for a single network, merged over the built-in table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkOverride {
    pub chain_id: u64,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default)]
    pub coordination_url: Option<String>,
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Required only when `chain_id` is not built in.
    #[serde(default)]
    pub add_network: Option<AddNetworkParams>,
}

/// Network identifier → configuration.
#[derive(Clone, Debug, Default)]
pub struct NetworkTable {
    networks: BTreeMap<u64, NetworkConfig>,
}

fn builtin_entry(
    chain_id: u64,
    chain_name: &str,
    currency: (&str, &str),
    rpc: &str,
    explorer: &str,
    coordination: &str,
) -> NetworkConfig {
    NetworkConfig {
        chain_id,
        factory: None,
        coordination_url: Some(coordination.to_string()),
        add_network: AddNetworkParams {
            chain_name: chain_name.to_string(),
            native_currency: NativeCurrency {
                name: currency.0.to_string(),
                symbol: currency.1.to_string(),
                decimals: 18,
            },
            rpc_urls: vec![rpc.to_string()],
            block_explorer_urls: vec![explorer.to_string()],
        },
    }
}

impl NetworkTable {
    /// Networks known without any configuration. Factories are deployment
    /// specific and always come from configuration.
    pub fn builtin() -> Self {
        let entries = [
            builtin_entry(
                1,
                "Ethereum",
                ("Ether", "ETH"),
                "https://ethereum-rpc.publicnode.com",
                "https://etherscan.io",
                "https://safe-transaction-mainnet.safe.global",
            ),
            builtin_entry(
                11_155_111,
                "Sepolia",
                ("Sepolia Ether", "ETH"),
                "https://ethereum-sepolia-rpc.publicnode.com",
                "https://sepolia.etherscan.io",
                "https://safe-transaction-sepolia.safe.global",
            ),
            builtin_entry(
                100,
                "Gnosis",
                ("xDai", "XDAI"),
                "https://rpc.gnosischain.com",
                "https://gnosisscan.io",
                "https://safe-transaction-gnosis-chain.safe.global",
            ),
            builtin_entry(
                8453,
                "Base",
                ("Ether", "ETH"),
                "https://mainnet.base.org",
                "https://basescan.org",
                "https://safe-transaction-base.safe.global",
            ),
        ];
        Self { networks: entries.into_iter().map(|n| (n.chain_id, n)).collect() }
    }

    pub fn get(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.get(&chain_id)
    }

    pub fn require(&self, chain_id: u64) -> Result<&NetworkConfig, ConfigError> {
        self.get(chain_id).ok_or(ConfigError::UnknownNetwork { chain_id })
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.networks.keys().copied()
    }

    /// Merges an override into the table. Unknown networks must carry their
    /// onboarding parameters.
    pub fn apply(&mut self, ov: &NetworkOverride) -> Result<(), ConfigError> {
        let entry = match self.networks.get_mut(&ov.chain_id) {
            Some(entry) => entry,
            None => {
                let add_network = ov.add_network.clone().ok_or(ConfigError::Invalid {
                    field: "networks",
                    reason: format!("chain {} is not built in and has no addNetwork", ov.chain_id),
                })?;
                self.networks.entry(ov.chain_id).or_insert(NetworkConfig {
                    chain_id: ov.chain_id,
                    factory: None,
                    coordination_url: None,
                    add_network,
                })
            }
        };
        if let Some(factory) = ov.factory {
            entry.factory = Some(factory);
        }
        if let Some(url) = &ov.coordination_url {
            entry.coordination_url = Some(url.clone());
        }
        if let Some(rpc) = &ov.rpc_url {
            entry.add_network.rpc_urls.retain(|u| u != rpc);
            entry.add_network.rpc_urls.insert(0, rpc.clone());
        }
        Ok(())
    }
}

/// Timer cadences of the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cadence {
    /// Local wall-clock tick driving countdown display.
    pub local_tick: Duration,
    /// Chain timestamp poll while any row is synchronizing.
    pub chain_poll: Duration,
    /// Full state re-read.
    pub full_poll: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            local_tick: Duration::from_secs(1),
            chain_poll: Duration::from_secs(5),
            full_poll: Duration::from_secs(30),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

impl Cadence {
    /// Defaults overridden by `HEIRSAFE_LOCAL_TICK_MS`, `HEIRSAFE_CHAIN_POLL_SECS`
    /// and `HEIRSAFE_FULL_POLL_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            local_tick: env_u64("HEIRSAFE_LOCAL_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.local_tick),
            chain_poll: env_u64("HEIRSAFE_CHAIN_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.chain_poll),
            full_poll: env_u64("HEIRSAFE_FULL_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.full_poll),
        }
    }
}

fn default_page_size() -> u64 {
    10
}

fn default_max_module_pages() -> u32 {
    256
}

/// Client configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Kept as text so a malformed value is reported by `validate` rather than
    /// as a generic parse failure.
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub networks: Vec<NetworkOverride>,
    /// Page size for enabled-module traversal.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Upper bound on module pages fetched per check.
    #[serde(default = "default_max_module_pages")]
    pub max_module_pages: u32,
    /// Where the last used account is remembered.
    #[serde(default)]
    pub preference_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            salt: None,
            networks: Vec::new(),
            page_size: default_page_size(),
            max_module_pages: default_max_module_pages(),
            preference_path: None,
        }
    }
}

/// Validated configuration ready for use.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub salt: DeploymentSalt,
    pub networks: NetworkTable,
    pub page_size: u64,
    pub max_module_pages: u32,
    pub preference_path: Option<PathBuf>,
    pub cadence: Cadence,
}

impl ClientConfig {
    /// Loads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        info!(path = %path.display(), networks = config.networks.len(), "loaded client config");
        Ok(config)
    }

    /// Applies `HEIRSAFE_SALT` over the file value.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(salt) = std::env::var("HEIRSAFE_SALT") {
            if self.salt.is_some() {
                warn!("HEIRSAFE_SALT overrides the salt from the config file");
            }
            self.salt = Some(salt);
        }
        self
    }

    /// Startup validation. Every error here is a configuration error.
    pub fn validate(&self) -> Result<ResolvedConfig, ConfigError> {
        let salt: DeploymentSalt = self.salt.as_deref().ok_or(ConfigError::MissingSalt)?.parse()?;

        if self.page_size == 0 {
            return Err(ConfigError::Invalid { field: "pageSize", reason: "must be > 0".into() });
        }
        if self.max_module_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "maxModulePages",
                reason: "must be > 0".into(),
            });
        }

        let mut networks = NetworkTable::builtin();
        for ov in &self.networks {
            if ov.factory.is_some_and(|f| f.is_zero()) {
                return Err(ConfigError::ZeroFactory { chain_id: ov.chain_id });
            }
            networks.apply(ov)?;
        }

        Ok(ResolvedConfig {
            salt,
            networks,
            page_size: self.page_size,
            max_module_pages: self.max_module_pages,
            preference_path: self.preference_path.clone(),
            cadence: Cadence::from_env(),
        })
    }
}
