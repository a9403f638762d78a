//! heirsafe: inspect and manage the inheritance module of a Safe account.

mod keystore;
mod wallet;

use alloy_primitives::{Address, B256};
use alloy_signer_local::PrivateKeySigner;
use clap::{Args, Parser, Subcommand};
use eyre::{bail, eyre, WrapErr};
use heirsafe_chainspec::{AddNetworkParams, ClientConfig, NetworkConfig, ResolvedConfig};
use heirsafe_primitives::parse_account_address;
use heirsafe_rpc::{ChainReader, RpcChainReader, RpcClient};
use heirsafe_sync::{
    reconcile_pass, ActionDispatcher, ActionUpdate, CountdownEngine, DisplayState,
    ModuleStateResolver, NetworkContext, PassOutcome, Reconciler, ReaderProvider,
    ReconciliationScope, SystemClock, WallClock, WalletCapability,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::keystore::Keystore;
use crate::wallet::LocalWallet;

#[derive(Parser)]
#[command(name = "heirsafe", about = "Inheritance module client for Safe accounts")]
struct Cli {
    /// Client configuration file (JSON).
    #[arg(long, env = "HEIRSAFE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Network to operate on.
    #[arg(long, env = "HEIRSAFE_CHAIN_ID", default_value_t = 1, global = true)]
    chain_id: u64,

    /// Seconds to wait for a transaction receipt.
    #[arg(long, env = "HEIRSAFE_RECEIPT_TIMEOUT_SECS", default_value_t = 180, global = true)]
    receipt_timeout_secs: u64,

    #[command(flatten)]
    key: KeyArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct KeyArgs {
    /// Owner signing key, hex.
    #[arg(long, env = "HEIRSAFE_PRIVATE_KEY", hide_env_values = true, global = true)]
    private_key: Option<String>,

    /// Encrypted owner key, used when no raw key is given.
    #[arg(long, env = "HEIRSAFE_KEYSTORE", global = true)]
    keystore: Option<PathBuf>,

    #[arg(long, env = "HEIRSAFE_KEYSTORE_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the module state once and print it.
    Status { account: String },
    /// Follow the module state and print every change.
    ///
    /// Reads `refresh`, `account <address>` and `network <chain id>` from stdin.
    Watch { account: Option<String> },
    /// Name a beneficiary for the signing owner.
    SetBeneficiary {
        account: String,
        #[arg(long)]
        beneficiary: Address,
        #[command(flatten)]
        activation: Activation,
    },
    /// Move the signing owner's activation time.
    Prolong {
        account: String,
        #[command(flatten)]
        activation: Activation,
    },
    /// Clear the signing owner's beneficiary.
    Remove { account: String },
    /// Take over `owner`'s seat as its beneficiary.
    Claim {
        account: String,
        #[arg(long)]
        owner: Address,
    },
    /// Deploy and enable the module, or print the steps for co-signers.
    Install { account: String },
    /// Print the parameters for adding the network to a wallet.
    Network,
    /// Encrypt the given key, or a fresh one, into a keystore file.
    NewKeystore {
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Activation {
    /// Activation time, unix seconds.
    #[arg(long)]
    at: Option<u64>,
    /// Activation delay from now, seconds.
    #[arg(long = "in")]
    after: Option<u64>,
}

impl Activation {
    fn resolve(&self, now: u64) -> eyre::Result<u64> {
        match (self.at, self.after) {
            (Some(at), _) => Ok(at),
            (None, Some(after)) => now.checked_add(after).ok_or_else(|| eyre!("activation overflows")),
            (None, None) => bail!("either --at or --in is required"),
        }
    }
}

/// JSON-RPC readers for networks with an endpoint.
struct RpcProvider;

impl ReaderProvider for RpcProvider {
    fn reader_for(&self, network: &NetworkConfig) -> Option<Arc<dyn ChainReader>> {
        let url = network.rpc_url()?;
        Some(Arc::new(RpcChainReader::new(RpcClient::new(url))))
    }
}

fn load_config(path: Option<&PathBuf>) -> eyre::Result<ResolvedConfig> {
    let config = match path {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    Ok(config.with_env_overrides().validate()?)
}

fn load_signer(key: &KeyArgs) -> eyre::Result<Option<PrivateKeySigner>> {
    if let Some(hex_key) = &key.private_key {
        let secret: B256 = hex_key.trim().parse().wrap_err("private key must be 32 bytes of hex")?;
        return Ok(Some(PrivateKeySigner::from_bytes(&secret)?));
    }
    let Some(path) = &key.keystore else {
        return Ok(None);
    };
    let password = key
        .password
        .as_deref()
        .ok_or_else(|| eyre!("--password is required to unlock {}", path.display()))?;
    Ok(Some(Keystore::load(path)?.decrypt(password)?))
}

struct Session {
    config: ResolvedConfig,
    network: NetworkConfig,
    reader: Arc<dyn ChainReader>,
    resolver: ModuleStateResolver,
}

impl Session {
    fn open(config: ResolvedConfig, chain_id: u64) -> eyre::Result<Self> {
        let network = config.networks.require(chain_id)?.clone();
        let reader =
            RpcProvider.reader_for(&network).ok_or_else(|| eyre!("chain {chain_id} has no RPC endpoint"))?;
        let resolver = ModuleStateResolver::new(
            reader.clone(),
            config.salt,
            config.page_size,
            config.max_module_pages,
        );
        Ok(Self { config, network, reader, resolver })
    }

    fn context(&self) -> NetworkContext {
        NetworkContext::from_config(&self.network)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn status(session: &Session, account: &str, caller: Option<Address>) -> eyre::Result<()> {
    let scope = ReconciliationScope::new();
    let token = scope.bump_epoch();
    let clock = SystemClock;
    let context = session.context();

    match reconcile_pass(&scope, &session.resolver, &context, token, account, &clock).await {
        PassOutcome::Committed => {}
        PassOutcome::Failed(e) => return Err(e.into()),
        PassOutcome::Stale => bail!("resolution was superseded"),
    }

    let snapshot = scope.snapshot();
    let now = clock.now_secs();
    let mut engine = CountdownEngine::new();
    engine.set_rows(context.chain_id, snapshot.heirs.clone());
    if let Some(sample) = snapshot.chain_time {
        engine.record_chain_sample(sample);
    }

    print_json(&DisplayState {
        epoch: snapshot.epoch,
        chain_id: Some(context.chain_id),
        account: snapshot.selected,
        caller,
        module: snapshot.network.as_ref().and_then(|n| n.module),
        installation: snapshot.installation,
        threshold: snapshot.account.as_ref().map(|a| a.threshold),
        rows: engine.views(now, caller),
        degraded: snapshot.degraded.clone(),
        chain_time: engine.chain_sample(),
        synchronizing: false,
        last_error: snapshot.last_error.clone(),
    })
}

async fn watch(
    config: ResolvedConfig,
    wallet: Arc<LocalWallet>,
    account: Option<&str>,
) -> eyre::Result<()> {
    let (reconciler, handle) = Reconciler::new(&config, Arc::new(RpcProvider), wallet.clone());
    let reconciler = match account {
        Some(account) => reconciler.with_account(parse_account_address(account)?),
        None => reconciler,
    };
    let task = tokio::spawn(reconciler.run());

    let mut display = handle.display();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = display.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = display.borrow_and_update().clone();
                println!("{}", serde_json::to_string(&state)?);
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        let mut words = line.split_whitespace();
                        match (words.next(), words.next()) {
                            (Some("refresh"), None) => handle.refresh(),
                            (Some("account"), Some(addr)) => match parse_account_address(addr) {
                                Ok(addr) => handle.select_account(addr),
                                Err(e) => warn!(input = addr, error = %e, "not an address"),
                            },
                            (Some("network"), Some(id)) => match id.parse() {
                                Ok(id) => {
                                    if let Err(e) = wallet.switch_network(id).await {
                                        warn!(chain_id = id, error = %e, "network switch failed");
                                    }
                                }
                                Err(e) => warn!(input = id, error = %e, "not a chain id"),
                            },
                            (None, _) => {}
                            _ => warn!(%line, "unknown command"),
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "stdin closed");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    handle.shutdown();
    task.await?;
    Ok(())
}

/// Logs progress of submitted actions.
fn spawn_update_log() -> mpsc::UnboundedSender<ActionUpdate> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                ActionUpdate::Pending { action, tx_hash } => {
                    info!(action = action.as_str(), %tx_hash, "submitted, waiting for inclusion")
                }
                ActionUpdate::Confirmed { action, tx_hash, block_number } => {
                    info!(action = action.as_str(), %tx_hash, block_number, "confirmed")
                }
                ActionUpdate::Failed { action, tx_hash, reason } => {
                    warn!(action = action.as_str(), ?tx_hash, %reason, "failed")
                }
            }
        }
    });
    tx
}

async fn dispatcher(
    session: &Session,
    wallet: Arc<LocalWallet>,
    account: &str,
) -> eyre::Result<ActionDispatcher> {
    let resolved = session.resolver.resolve(&session.context(), account, &[]).await?;
    Ok(ActionDispatcher::new(
        session.reader.clone(),
        wallet,
        resolved.context,
        resolved.account.address,
        session.config.salt,
    )
    .with_coordination_url(session.network.coordination_url.clone())
    .with_paging(session.config.page_size, session.config.max_module_pages)
    .with_updates(spawn_update_log()))
}

fn owner_of(wallet: &LocalWallet) -> eyre::Result<Address> {
    wallet.address().ok_or_else(|| eyre!("a signing key is required (--private-key or --keystore)"))
}

fn new_keystore(key: &KeyArgs, out: &PathBuf) -> eyre::Result<()> {
    let password = key.password.as_deref().ok_or_else(|| eyre!("--password is required"))?;
    let signer = match key.private_key {
        Some(_) => load_signer(key)?.ok_or_else(|| eyre!("no key"))?,
        None => PrivateKeySigner::random(),
    };
    let keystore = Keystore::encrypt(&signer.to_bytes(), password)?;
    keystore.save(out)?;
    info!(address = %keystore.address, path = %out.display(), "keystore written");
    Ok(())
}

/// Config, signing wallet and chain session for the commands that talk to a
/// network.
fn connect(cli: &Cli) -> eyre::Result<(Session, Arc<LocalWallet>)> {
    let config = load_config(cli.config.as_ref())?;
    let wallet = LocalWallet::new(load_signer(&cli.key)?, config.networks.clone(), cli.chain_id)?
        .with_receipt_timeout(Duration::from_secs(cli.receipt_timeout_secs));
    let session = Session::open(config, cli.chain_id)?;
    Ok((session, Arc::new(wallet)))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let now = SystemClock.now_secs();

    match &cli.command {
        Command::NewKeystore { out } => new_keystore(&cli.key, out)?,
        Command::Network => {
            let config = load_config(cli.config.as_ref())?;
            let network = config.networks.require(cli.chain_id)?;
            print_json(&serde_json::json!({
                "chainId": AddNetworkParams::chain_id_hex(network.chain_id),
                "params": network.add_network,
                "factory": network.factory,
                "coordinationUrl": network.coordination_url,
            }))?;
        }
        Command::Status { account } => {
            let (session, wallet) = connect(&cli)?;
            status(&session, account, wallet.address()).await?;
        }
        Command::Watch { account } => {
            let (session, wallet) = connect(&cli)?;
            watch(session.config, wallet, account.as_deref()).await?;
        }
        Command::SetBeneficiary { account, beneficiary, activation } => {
            let (session, wallet) = connect(&cli)?;
            let owner = owner_of(&wallet)?;
            let outcome = dispatcher(&session, wallet, account)
                .await?
                .set_beneficiary(owner, *beneficiary, activation.resolve(now)?)
                .await?;
            info!(tx_hash = %outcome.tx_hash, "beneficiary set");
        }
        Command::Prolong { account, activation } => {
            let (session, wallet) = connect(&cli)?;
            let owner = owner_of(&wallet)?;
            let outcome = dispatcher(&session, wallet, account)
                .await?
                .prolong_activation(owner, activation.resolve(now)?)
                .await?;
            info!(tx_hash = %outcome.tx_hash, "activation time moved");
        }
        Command::Remove { account } => {
            let (session, wallet) = connect(&cli)?;
            let owner = owner_of(&wallet)?;
            let outcome =
                dispatcher(&session, wallet, account).await?.remove_beneficiary(owner).await?;
            info!(tx_hash = %outcome.tx_hash, "beneficiary removed");
        }
        Command::Claim { account, owner } => {
            let (session, wallet) = connect(&cli)?;
            let outcome = dispatcher(&session, wallet, account).await?.claim_safe(*owner).await?;
            info!(tx_hash = %outcome.tx_hash, "ownership claimed");
        }
        Command::Install { account } => {
            let (session, wallet) = connect(&cli)?;
            let plan = dispatcher(&session, wallet, account).await?.install().await?;
            print_json(&plan)?;
        }
    }
    Ok(())
}
