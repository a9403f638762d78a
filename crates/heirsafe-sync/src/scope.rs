use alloy_primitives::Address;
use arc_swap::ArcSwap;
use heirsafe_primitives::{AccountRecord, HeirConfig, ModuleInstallationState};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::countdown::ChainTimeSample;
use crate::resolver::NetworkContext;

/// Epoch captured when an asynchronous operation starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochToken(u64);

impl EpochToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// The shared reconciled state. Readers get immutable snapshots.
#[derive(Clone, Debug, Default)]
pub struct ReconciledState {
    /// Epoch of the write that produced this snapshot.
    pub epoch: u64,
    pub network: Option<NetworkContext>,
    /// Account being inspected.
    pub selected: Option<Address>,
    pub account: Option<AccountRecord>,
    pub installation: Option<ModuleInstallationState>,
    /// One row per owner, in the account's owner order.
    pub heirs: Vec<HeirConfig>,
    /// Owners whose row is a fallback because their read failed.
    pub degraded: Vec<Address>,
    pub chain_time: Option<ChainTimeSample>,
    /// Persistent, user-facing failure of the last pass.
    pub last_error: Option<String>,
}

impl ReconciledState {
    /// Rows of a previous pass over the same account on the same network.
    pub fn prior_rows(&self, chain_id: u64, account: Address) -> &[HeirConfig] {
        let same_network = self.network.as_ref().is_some_and(|n| n.chain_id == chain_id);
        let same_account = self.account.as_ref().is_some_and(|a| a.address == account);
        if same_network && same_account {
            &self.heirs
        } else {
            &[]
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("reconciliation write lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Owner of the reconciliation epoch and sole writer of the shared state.
///
/// Every triggering event bumps the epoch. Asynchronous work captures a token
/// when it starts and may only write while that token is still current;
/// late writes are dropped silently. Bumps and writes serialize on one lock,
/// so a write can never land after a bump that superseded it.
#[derive(Debug)]
pub struct ReconciliationScope {
    epoch: AtomicU64,
    state: ArcSwap<ReconciledState>,
    write_lock: Mutex<()>,
}

impl Default for ReconciliationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationScope {
    /// Starts at epoch 0 with an empty state.
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            state: ArcSwap::from_pointee(ReconciledState::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Starts a new epoch, invalidating every outstanding token.
    pub fn bump_epoch(&self) -> EpochToken {
        let _guard = lock_or_recover(&self.write_lock);
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("heirsafe_epoch").set(next as f64);
        debug!(epoch = next, "epoch bumped");
        EpochToken(next)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Token for the current epoch without starting a new one. Used by
    /// periodic reads that refine a pass rather than replace it.
    pub fn current_token(&self) -> EpochToken {
        EpochToken(self.current_epoch())
    }

    pub fn is_current(&self, token: EpochToken) -> bool {
        self.current_epoch() == token.0
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ReconciledState> {
        self.state.load_full()
    }

    /// Applies `update` if `token` is still current. Returns whether it was applied.
    pub fn commit(&self, token: EpochToken, update: impl FnOnce(&mut ReconciledState)) -> bool {
        let _guard = lock_or_recover(&self.write_lock);
        if !self.is_current(token) {
            counter!("heirsafe_stale_writes_dropped_total").increment(1);
            debug!(
                token = token.0,
                current = self.current_epoch(),
                "dropping write from superseded epoch"
            );
            return false;
        }
        let mut next = ReconciledState::clone(&self.state.load());
        update(&mut next);
        next.epoch = token.0;
        self.state.store(Arc::new(next));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_increments_once_per_bump() {
        let scope = ReconciliationScope::new();
        assert_eq!(scope.current_epoch(), 0);

        let before = scope.current_epoch();
        for _ in 0..17 {
            scope.bump_epoch();
        }
        assert_eq!(scope.current_epoch(), before + 17);
    }

    #[test]
    fn test_stale_token_write_is_dropped() {
        let scope = ReconciliationScope::new();
        let old = scope.bump_epoch();
        let new = scope.bump_epoch();

        assert!(!scope.is_current(old));
        assert!(scope.is_current(new));

        assert!(scope.commit(new, |s| s.last_error = Some("fresh".into())));
        assert!(!scope.commit(old, |s| s.last_error = Some("stale".into())));

        let snap = scope.snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("fresh"));
        assert_eq!(snap.epoch, new.value());
    }

    #[test]
    fn test_commit_before_any_later_bump_is_visible() {
        let scope = ReconciliationScope::new();
        let token = scope.bump_epoch();
        assert!(scope.commit(token, |s| s.heirs.push(HeirConfig::unset(Address::repeat_byte(1)))));
        scope.bump_epoch();

        // Earlier write survives; it is just no longer extendable.
        assert_eq!(scope.snapshot().heirs.len(), 1);
        assert!(!scope.commit(token, |s| s.heirs.clear()));
        assert_eq!(scope.snapshot().heirs.len(), 1);
    }

    #[test]
    fn test_prior_rows_only_for_same_account_and_network() {
        let account = Address::repeat_byte(0xAA);
        let state = ReconciledState {
            network: Some(NetworkContext::new(1, None)),
            account: Some(AccountRecord { address: account, owners: vec![], threshold: 1 }),
            heirs: vec![HeirConfig::unset(Address::repeat_byte(1))],
            ..Default::default()
        };
        assert_eq!(state.prior_rows(1, account).len(), 1);
        assert!(state.prior_rows(2, account).is_empty());
        assert!(state.prior_rows(1, Address::repeat_byte(0xBB)).is_empty());
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let scope = ReconciliationScope::new();
        let before = scope.snapshot();
        let token = scope.bump_epoch();
        scope.commit(token, |s| s.last_error = Some("x".into()));
        assert!(before.last_error.is_none());
    }
}
