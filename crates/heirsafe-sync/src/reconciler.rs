use alloy_primitives::Address;
use heirsafe_chainspec::{Cadence, NetworkConfig, NetworkTable, ResolvedConfig};
use heirsafe_primitives::{parse_account_address, DeploymentSalt, ModuleInstallationState};
use heirsafe_rpc::ChainReader;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{SystemClock, WallClock};
use crate::countdown::{ChainTimeSample, CountdownEngine, PollTransition, RowView};
use crate::error::ResolveError;
use crate::preference::PreferenceStore;
use crate::resolver::{ModuleStateResolver, NetworkContext};
use crate::scope::{EpochToken, ReconciledState, ReconciliationScope};
use crate::wallet::{WalletCapability, WalletEvent};

/// Consecutive transient failures after which they are surfaced to the user.
pub const TRANSIENT_ESCALATION_CYCLES: u32 = 3;

/// An event that invalidates in-flight work and starts a new pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Load,
    ManualRefresh,
    NetworkChanged(u64),
    /// The wallet's connected account changed.
    AccountChanged(Option<Address>),
    /// The user picked an account to inspect.
    AccountSelected(Address),
    ActionSettled,
    FullPoll,
}

/// Builds a chain reader for a network.
pub trait ReaderProvider: Send + Sync {
    /// `None` when the network has no reachable endpoint.
    fn reader_for(&self, network: &NetworkConfig) -> Option<Arc<dyn ChainReader>>;
}

/// What the front-end renders. Republished on every local tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayState {
    pub epoch: u64,
    pub chain_id: Option<u64>,
    pub account: Option<Address>,
    pub caller: Option<Address>,
    pub module: Option<Address>,
    pub installation: Option<ModuleInstallationState>,
    pub threshold: Option<u64>,
    pub rows: Vec<RowView>,
    pub degraded: Vec<Address>,
    pub chain_time: Option<ChainTimeSample>,
    /// A chain-time poll is running.
    pub synchronizing: bool,
    pub last_error: Option<String>,
}

/// How one pass ended.
#[derive(Debug)]
pub enum PassOutcome {
    Committed,
    /// A newer epoch started; nothing was written.
    Stale,
    Failed(ResolveError),
}

/// Records `sample` unless a newer sample from the same network is present.
fn commit_chain_time(scope: &ReconciliationScope, token: EpochToken, sample: ChainTimeSample) -> bool {
    scope.commit(token, |state| {
        let keep_current = state
            .chain_time
            .is_some_and(|c| c.chain_id == sample.chain_id && c.chain_timestamp >= sample.chain_timestamp);
        if !keep_current {
            state.chain_time = Some(sample);
        }
    })
}

/// Runs one resolution for `account` under `token` and commits the result.
///
/// Non-transient failures are committed as the state's `last_error`;
/// transient ones are returned for the caller to count and retry.
pub async fn reconcile_pass(
    scope: &ReconciliationScope,
    resolver: &ModuleStateResolver,
    context: &NetworkContext,
    token: EpochToken,
    account: &str,
    clock: &dyn WallClock,
) -> PassOutcome {
    counter!("heirsafe_reconcile_passes_total").increment(1);

    let snapshot = scope.snapshot();
    let prior = account
        .trim()
        .parse::<Address>()
        .map(|a| snapshot.prior_rows(context.chain_id, a).to_vec())
        .unwrap_or_default();
    drop(snapshot);

    let resolved = match resolver.resolve(context, account, &prior).await {
        Ok(resolved) => resolved,
        Err(e) => {
            if !scope.is_current(token) {
                return PassOutcome::Stale;
            }
            if !e.is_transient() {
                let message = e.to_string();
                scope.commit(token, |state| {
                    state.account = None;
                    state.installation = None;
                    state.heirs.clear();
                    state.degraded.clear();
                    state.last_error = Some(message);
                });
            }
            return PassOutcome::Failed(e);
        }
    };

    let committed = scope.commit(token, |state| {
        state.network = Some(resolved.context.clone());
        state.selected = Some(resolved.account.address);
        state.account = Some(resolved.account.clone());
        state.installation = Some(resolved.installation);
        state.heirs = resolved.heirs.clone();
        state.degraded = resolved.degraded.clone();
        state.last_error = None;
    });
    if !committed {
        return PassOutcome::Stale;
    }

    match resolver.reader().latest_confirmed_timestamp().await {
        Ok(chain_timestamp) => {
            let sample = ChainTimeSample {
                chain_id: context.chain_id,
                observed_at: clock.now_secs(),
                chain_timestamp,
            };
            commit_chain_time(scope, token, sample);
        }
        Err(e) => debug!(error = %e, "chain time read failed, keeping previous sample"),
    }
    PassOutcome::Committed
}

/// Reader and resolver bound to the active network.
struct ActiveNetwork {
    context: NetworkContext,
    resolver: Arc<ModuleStateResolver>,
}

/// Cheap handle for driving a running [`Reconciler`].
#[derive(Clone)]
pub struct ReconcilerHandle {
    triggers: mpsc::UnboundedSender<Trigger>,
    display: watch::Receiver<DisplayState>,
    scope: Arc<ReconciliationScope>,
    shutdown: Arc<Notify>,
}

impl ReconcilerHandle {
    pub fn trigger(&self, trigger: Trigger) {
        if self.triggers.send(trigger).is_err() {
            debug!(?trigger, "reconciler stopped, trigger ignored");
        }
    }

    pub fn refresh(&self) {
        self.trigger(Trigger::ManualRefresh);
    }

    pub fn select_account(&self, account: Address) {
        self.trigger(Trigger::AccountSelected(account));
    }

    /// Sender for components that request passes themselves, such as the
    /// action dispatcher.
    pub fn triggers(&self) -> mpsc::UnboundedSender<Trigger> {
        self.triggers.clone()
    }

    pub fn display(&self) -> watch::Receiver<DisplayState> {
        self.display.clone()
    }

    pub fn scope(&self) -> &Arc<ReconciliationScope> {
        &self.scope
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// The reconciliation event loop.
///
/// Multiplexes wallet events, explicit triggers and three cadences: the local
/// tick that re-derives row views, the chain-time poll that runs only while a
/// row is synchronizing, and the periodic full re-read. Every trigger bumps
/// the epoch exactly once; the pass it starts runs in its own task and writes
/// only while that epoch is current.
pub struct Reconciler {
    scope: Arc<ReconciliationScope>,
    networks: NetworkTable,
    provider: Arc<dyn ReaderProvider>,
    wallet: Arc<dyn WalletCapability>,
    clock: Arc<dyn WallClock>,
    salt: DeploymentSalt,
    page_size: u64,
    max_pages: u32,
    cadence: Cadence,
    preference: Option<PreferenceStore>,

    triggers_rx: mpsc::UnboundedReceiver<Trigger>,
    display_tx: watch::Sender<DisplayState>,
    shutdown: Arc<Notify>,

    active: Option<ActiveNetwork>,
    /// Chain id the wallet reported, even when unsupported.
    wallet_chain: Option<u64>,
    selected: Option<Address>,
    /// `selected` came from the caller and is not yet stored as the preference.
    persist_selected: bool,
    caller: Option<Address>,
    engine: CountdownEngine,
    transient_failures: u32,
}

impl Reconciler {
    pub fn new(
        config: &ResolvedConfig,
        provider: Arc<dyn ReaderProvider>,
        wallet: Arc<dyn WalletCapability>,
    ) -> (Self, ReconcilerHandle) {
        let scope = Arc::new(ReconciliationScope::new());
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = watch::channel(DisplayState::default());
        let shutdown = Arc::new(Notify::new());

        let handle = ReconcilerHandle {
            triggers: triggers_tx,
            display: display_rx,
            scope: scope.clone(),
            shutdown: shutdown.clone(),
        };

        let reconciler = Self {
            scope,
            networks: config.networks.clone(),
            provider,
            wallet,
            clock: Arc::new(SystemClock),
            salt: config.salt,
            page_size: config.page_size,
            max_pages: config.max_module_pages,
            cadence: config.cadence,
            preference: config.preference_path.clone().map(PreferenceStore::new),
            triggers_rx,
            display_tx,
            shutdown,
            active: None,
            wallet_chain: None,
            selected: None,
            persist_selected: false,
            caller: None,
            engine: CountdownEngine::new(),
            transient_failures: 0,
        };
        (reconciler, handle)
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Account to inspect on load, taking precedence over the stored
    /// preference. It becomes the new preference once loaded.
    pub fn with_account(mut self, account: Address) -> Self {
        self.selected = Some(account);
        self.persist_selected = true;
        self
    }

    /// Runs until [`ReconcilerHandle::shutdown`] is called.
    pub async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(EpochToken, PassOutcome)>();
        let mut wallet_events = Some(self.wallet.subscribe());
        let shutdown = self.shutdown.clone();

        let mut local_tick = interval(self.cadence.local_tick);
        local_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut full_poll = interval_at(Instant::now() + self.cadence.full_poll, self.cadence.full_poll);
        full_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut chain_poll: Option<Interval> = None;

        self.handle_trigger(Trigger::Load, &done_tx).await;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("reconciler shutting down");
                    break;
                }

                // Branch 1: local tick -> re-derive row views
                _ = local_tick.tick() => {
                    self.on_local_tick(&mut chain_poll);
                }

                // Branch 2: chain-time poll, only while a row is synchronizing
                _ = async {
                    match chain_poll.as_mut() {
                        Some(poll) => {
                            poll.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    self.poll_chain_time();
                }

                // Branch 3: periodic full re-read
                _ = full_poll.tick() => {
                    self.handle_trigger(Trigger::FullPoll, &done_tx).await;
                }

                // Branch 4: wallet notifications
                event = async {
                    match wallet_events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Ok(WalletEvent::NetworkChanged(chain_id)) => {
                            self.handle_trigger(Trigger::NetworkChanged(chain_id), &done_tx).await;
                        }
                        Ok(WalletEvent::AccountChanged(account)) => {
                            self.handle_trigger(Trigger::AccountChanged(account), &done_tx).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "wallet events lagged, resynchronizing");
                            self.handle_trigger(Trigger::Load, &done_tx).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("wallet event stream closed");
                            wallet_events = None;
                        }
                    }
                }

                // Branch 5: explicit triggers
                Some(trigger) = self.triggers_rx.recv() => {
                    self.handle_trigger(trigger, &done_tx).await;
                }

                // Branch 6: finished passes
                Some((token, outcome)) = done_rx.recv() => {
                    self.on_pass_done(token, outcome);
                }
            }
        }
    }

    async fn handle_trigger(
        &mut self,
        trigger: Trigger,
        done: &mpsc::UnboundedSender<(EpochToken, PassOutcome)>,
    ) {
        debug!(?trigger, "reconciliation trigger");
        let mut network_switched = false;
        let previous_selection = self.selected;

        match trigger {
            Trigger::Load => {
                match self.selected {
                    Some(account) if self.persist_selected => {
                        self.persist_selected = false;
                        if let Err(e) = parse_account_address(&account.to_string()) {
                            warn!(%account, error = %e, "ignoring invalid startup account");
                            self.selected = None;
                        } else {
                            self.remember(account);
                        }
                    }
                    Some(_) => {}
                    None => {
                        self.selected = self.preference.as_ref().and_then(|p| p.load_last_account());
                    }
                }
                self.caller = self.wallet.current_account().await.ok().flatten();
                match self.wallet.current_chain_id().await {
                    Ok(chain_id) if Some(chain_id) != self.wallet_chain => {
                        self.bind_network(chain_id);
                        network_switched = true;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "wallet did not report a network"),
                }
            }
            Trigger::NetworkChanged(chain_id) => {
                if Some(chain_id) != self.wallet_chain {
                    self.bind_network(chain_id);
                    network_switched = true;
                }
            }
            Trigger::AccountChanged(account) => {
                self.caller = account;
            }
            Trigger::AccountSelected(account) => match parse_account_address(&account.to_string()) {
                Ok(account) => {
                    self.selected = Some(account);
                    self.remember(account);
                }
                Err(e) => warn!(%account, error = %e, "ignoring invalid account selection"),
            },
            Trigger::ManualRefresh | Trigger::ActionSettled | Trigger::FullPoll => {}
        }

        let token = self.scope.bump_epoch();

        // Nothing read for the previous network or account may stay on screen.
        if network_switched || self.selected != previous_selection {
            let network = self.active.as_ref().map(|a| a.context.clone());
            let unsupported = self
                .wallet_chain
                .filter(|_| network.is_none())
                .map(|chain_id| format!("network {chain_id} is not supported"));
            let selected = self.selected;
            self.scope.commit(token, |state| {
                *state = ReconciledState { network, selected, last_error: unsupported, ..Default::default() };
            });
            self.engine.reset();
            self.transient_failures = 0;
        }

        self.start_pass(token, done);
        self.publish();
    }

    fn remember(&self, account: Address) {
        if let Some(preference) = &self.preference {
            if let Err(e) = preference.save_last_account(account) {
                warn!(error = %e, "failed to persist last used account");
            }
        }
    }

    fn bind_network(&mut self, chain_id: u64) {
        self.wallet_chain = Some(chain_id);
        self.active = None;

        let Some(config) = self.networks.get(chain_id) else {
            warn!(chain_id, "wallet switched to an unsupported network");
            return;
        };
        let Some(reader) = self.provider.reader_for(config) else {
            warn!(chain_id, "no chain reader available for network");
            return;
        };

        let resolver = ModuleStateResolver::new(reader, self.salt, self.page_size, self.max_pages);
        self.active = Some(ActiveNetwork {
            context: NetworkContext::from_config(config),
            resolver: Arc::new(resolver),
        });
        info!(chain_id, "bound network context");
    }

    fn start_pass(&self, token: EpochToken, done: &mpsc::UnboundedSender<(EpochToken, PassOutcome)>) {
        let (Some(active), Some(account)) = (&self.active, self.selected) else {
            debug!(epoch = token.value(), "nothing to reconcile");
            return;
        };

        let scope = self.scope.clone();
        let resolver = active.resolver.clone();
        let context = active.context.clone();
        let clock = self.clock.clone();
        let done = done.clone();

        tokio::spawn(async move {
            let account = account.to_string();
            let outcome = reconcile_pass(&scope, &resolver, &context, token, &account, clock.as_ref()).await;
            let _ = done.send((token, outcome));
        });
    }

    fn on_pass_done(&mut self, token: EpochToken, outcome: PassOutcome) {
        match outcome {
            PassOutcome::Committed => {
                self.transient_failures = 0;
                self.sync_engine();
                self.publish();
            }
            PassOutcome::Stale => {
                debug!(epoch = token.value(), "pass superseded");
            }
            PassOutcome::Failed(e) if e.is_transient() => {
                self.transient_failures += 1;
                if self.transient_failures >= TRANSIENT_ESCALATION_CYCLES {
                    error!(failures = self.transient_failures, error = %e, "chain repeatedly unreachable");
                    let message = e.to_string();
                    self.scope.commit(token, |state| state.last_error = Some(message));
                    self.publish();
                } else if self.transient_failures == 1 {
                    warn!(error = %e, "transient chain error, retrying next cycle");
                } else {
                    debug!(failures = self.transient_failures, error = %e, "transient chain error persists");
                }
            }
            PassOutcome::Failed(e) => {
                self.transient_failures = 0;
                warn!(epoch = token.value(), error = %e, "reconciliation failed");
                self.sync_engine();
                self.publish();
            }
        }
    }

    fn sync_engine(&mut self) {
        let snapshot = self.scope.snapshot();
        match &snapshot.network {
            Some(network) => {
                self.engine.set_rows(network.chain_id, snapshot.heirs.clone());
                if let Some(sample) = snapshot.chain_time {
                    self.engine.record_chain_sample(sample);
                }
            }
            None => self.engine.reset(),
        }
    }

    fn on_local_tick(&mut self, chain_poll: &mut Option<Interval>) {
        self.sync_engine();
        match self.engine.update_poll_state(self.clock.now_secs()) {
            PollTransition::Start => {
                debug!("chain time poll started");
                let mut poll = interval(self.cadence.chain_poll);
                poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *chain_poll = Some(poll);
            }
            PollTransition::Stop => {
                debug!("chain time poll stopped");
                *chain_poll = None;
            }
            PollTransition::Unchanged => {}
        }
        self.publish();
    }

    fn poll_chain_time(&self) {
        let Some(active) = &self.active else { return };
        counter!("heirsafe_chain_time_polls_total").increment(1);

        let token = self.scope.current_token();
        let scope = self.scope.clone();
        let reader = active.resolver.reader().clone();
        let chain_id = active.context.chain_id;
        let clock = self.clock.clone();

        tokio::spawn(async move {
            match reader.latest_confirmed_timestamp().await {
                Ok(chain_timestamp) => {
                    let sample = ChainTimeSample { chain_id, observed_at: clock.now_secs(), chain_timestamp };
                    commit_chain_time(&scope, token, sample);
                }
                Err(e) => debug!(chain_id, error = %e, "chain time poll failed"),
            }
        });
    }

    fn publish(&self) {
        let snapshot = self.scope.snapshot();
        let now = self.clock.now_secs();
        let state = DisplayState {
            epoch: snapshot.epoch,
            chain_id: snapshot.network.as_ref().map(|n| n.chain_id).or(self.wallet_chain),
            account: self.selected,
            caller: self.caller,
            module: snapshot.network.as_ref().and_then(|n| n.module),
            installation: snapshot.installation,
            threshold: snapshot.account.as_ref().map(|a| a.threshold),
            rows: self.engine.views(now, self.caller),
            degraded: snapshot.degraded.clone(),
            chain_time: self.engine.chain_sample(),
            synchronizing: self.engine.is_polling(),
            last_error: snapshot.last_error.clone(),
        };
        self.display_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
