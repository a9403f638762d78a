//! Dual-clock countdown.
//!
//! Display uses the local wall clock only, so the countdown ticks smoothly
//! regardless of network latency. Claim availability uses the last confirmed
//! chain timestamp only, so a fast or skewed local clock can never enable a
//! claim the chain would reject.

use alloy_primitives::Address;
use heirsafe_primitives::HeirConfig;
use serde::Serialize;

/// A confirmed chain timestamp and when it was observed locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTimeSample {
    pub chain_id: u64,
    pub observed_at: u64,
    pub chain_timestamp: u64,
}

/// Per-row countdown state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum CountdownPhase {
    /// No activation time configured.
    Unset,
    /// Local clock has not reached the activation time.
    CountingDown { remaining: u64 },
    /// Local clock says ready, chain has not confirmed it.
    Synchronizing,
    /// Chain time has reached the activation time.
    Available,
}

/// Derives the phase of one activation time.
///
/// `Available` is decided first and from chain time alone, which keeps the
/// claim gate exactly `chain_time >= activation`. An unknown chain time never
/// yields `Available`.
pub fn derive_phase(activation: u64, local_now: u64, chain_time: Option<u64>) -> CountdownPhase {
    if activation == 0 {
        return CountdownPhase::Unset;
    }
    if chain_time.is_some_and(|c| c >= activation) {
        return CountdownPhase::Available;
    }
    if activation > local_now {
        CountdownPhase::CountingDown { remaining: activation - local_now }
    } else {
        CountdownPhase::Synchronizing
    }
}

/// Formats a duration as `1d 2h 3m 4s`, omitting leading zero units.
pub fn format_remaining(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// What a row shows and whether the connected caller may claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowView {
    pub config: HeirConfig,
    pub phase: CountdownPhase,
    /// Remaining time while counting down.
    pub remaining: Option<String>,
    /// Beneficiary without activation time or the reverse.
    pub inconsistent: bool,
    pub claim_enabled: bool,
}

/// Change to the chain-time poll lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollTransition {
    Start,
    Stop,
    Unchanged,
}

/// Derives row views from the latest committed rows and chain time.
#[derive(Clone, Debug, Default)]
pub struct CountdownEngine {
    chain_id: Option<u64>,
    rows: Vec<HeirConfig>,
    chain_sample: Option<ChainTimeSample>,
    polling: bool,
}

impl CountdownEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the rows. A different network invalidates the chain sample.
    pub fn set_rows(&mut self, chain_id: u64, rows: Vec<HeirConfig>) {
        if self.chain_id != Some(chain_id) {
            self.chain_sample = None;
        }
        self.chain_id = Some(chain_id);
        self.rows = rows;
    }

    /// Forgets everything, as on a network change.
    pub fn reset(&mut self) {
        self.chain_id = None;
        self.rows.clear();
        self.chain_sample = None;
    }

    /// Records a chain time sample. Samples from another network are ignored;
    /// chain time never moves backwards, so an older sample never replaces a
    /// newer one. Returns whether the sample was taken.
    pub fn record_chain_sample(&mut self, sample: ChainTimeSample) -> bool {
        if self.chain_id != Some(sample.chain_id) {
            return false;
        }
        match self.chain_sample {
            Some(current) if current.chain_timestamp >= sample.chain_timestamp => false,
            _ => {
                self.chain_sample = Some(sample);
                true
            }
        }
    }

    pub fn chain_sample(&self) -> Option<ChainTimeSample> {
        self.chain_sample
    }

    pub fn rows(&self) -> &[HeirConfig] {
        &self.rows
    }

    fn chain_time(&self) -> Option<u64> {
        self.chain_sample.map(|s| s.chain_timestamp)
    }

    pub fn phase_of(&self, row: &HeirConfig, local_now: u64) -> CountdownPhase {
        derive_phase(row.activation_time, local_now, self.chain_time())
    }

    /// Claim gate for `owner`'s row. Depends on chain time only.
    pub fn claim_enabled(&self, owner: Address, caller: Option<Address>) -> bool {
        let Some(caller) = caller else { return false };
        self.rows.iter().find(|r| r.owner == owner).is_some_and(|row| {
            row.has_beneficiary()
                && row.beneficiary == caller
                && row.activation_time != 0
                && self.chain_time().is_some_and(|c| c >= row.activation_time)
        })
    }

    /// Views for every row at `local_now`, for the connected `caller`.
    pub fn views(&self, local_now: u64, caller: Option<Address>) -> Vec<RowView> {
        self.rows
            .iter()
            .map(|row| {
                let phase = self.phase_of(row, local_now);
                let remaining = match phase {
                    CountdownPhase::CountingDown { remaining } => Some(format_remaining(remaining)),
                    _ => None,
                };
                RowView {
                    config: *row,
                    phase,
                    remaining,
                    inconsistent: row.is_inconsistent(),
                    claim_enabled: self.claim_enabled(row.owner, caller),
                }
            })
            .collect()
    }

    /// Whether any row is waiting on chain confirmation.
    pub fn needs_chain_poll(&self, local_now: u64) -> bool {
        self.rows
            .iter()
            .any(|row| self.phase_of(row, local_now) == CountdownPhase::Synchronizing)
    }

    /// Updates the poll lifecycle flag and reports the transition.
    pub fn update_poll_state(&mut self, local_now: u64) -> PollTransition {
        let needed = self.needs_chain_poll(local_now);
        match (self.polling, needed) {
            (false, true) => {
                self.polling = true;
                PollTransition::Start
            }
            (true, false) => {
                self.polling = false;
                PollTransition::Stop
            }
            _ => PollTransition::Unchanged,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }
}
