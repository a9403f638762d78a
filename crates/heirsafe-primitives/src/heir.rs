use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Marker address at both ends of the account's owner and module linked lists.
///
/// Used as the starting cursor for paginated module traversal and as the
/// predecessor of the first owner.
pub const SENTINEL: Address = address!("0000000000000000000000000000000000000001");

/// Rejected address input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("malformed address {input:?}")]
    Malformed { input: String },
    #[error("address must not be the zero address")]
    Zero,
}

/// Parses a user-supplied account address.
///
/// Accepts any 20-byte hex string with or without `0x`. The zero address and
/// the list sentinel are rejected since neither can be a real account.
pub fn parse_account_address(input: &str) -> Result<Address, AddressError> {
    let trimmed = input.trim();
    let address = Address::from_str(trimmed)
        .map_err(|_| AddressError::Malformed { input: trimmed.to_string() })?;
    if address.is_zero() {
        return Err(AddressError::Zero);
    }
    if address == SENTINEL {
        return Err(AddressError::Malformed { input: trimmed.to_string() });
    }
    Ok(address)
}

/// One owner's heir configuration as stored by the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeirConfig {
    pub owner: Address,
    /// `Address::ZERO` when unset.
    pub beneficiary: Address,
    /// Seconds since the Unix epoch, UTC. `0` when unset.
    pub activation_time: u64,
}

impl HeirConfig {
    /// An owner with nothing configured.
    pub fn unset(owner: Address) -> Self {
        Self { owner, beneficiary: Address::ZERO, activation_time: 0 }
    }

    pub fn has_beneficiary(&self) -> bool {
        !self.beneficiary.is_zero()
    }

    /// True when neither field carries a value.
    pub fn is_unset(&self) -> bool {
        self.beneficiary.is_zero() && self.activation_time == 0
    }

    /// A beneficiary without an activation time (or the reverse).
    ///
    /// Such rows are displayed but can never become claimable.
    pub fn is_inconsistent(&self) -> bool {
        self.has_beneficiary() != (self.activation_time != 0)
    }
}

/// Snapshot of a multi-signature account read in one pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub address: Address,
    /// Owners in the order the account reports them.
    pub owners: Vec<Address>,
    pub threshold: u64,
}

impl AccountRecord {
    pub fn is_owner(&self, candidate: Address) -> bool {
        self.owners.contains(&candidate)
    }

    /// The owner preceding `owner` in the account's linked list.
    ///
    /// Returns [`SENTINEL`] for the first owner and `None` when `owner` is not
    /// in the list.
    pub fn previous_owner(&self, owner: Address) -> Option<Address> {
        let position = self.owners.iter().position(|o| *o == owner)?;
        Some(if position == 0 { SENTINEL } else { self.owners[position - 1] })
    }
}

/// Installation progress of the predicted module for an account.
///
/// Only moves forward, and only as a result of re-reading the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleInstallationState {
    NotDeployed,
    DeployedNotEnabled,
    Enabled,
}

impl ModuleInstallationState {
    pub fn is_deployed(&self) -> bool {
        !matches!(self, Self::NotDeployed)
    }
}

impl std::fmt::Display for ModuleInstallationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotDeployed => "not deployed",
            Self::DeployedNotEnabled => "deployed, not enabled",
            Self::Enabled => "enabled",
        };
        f.write_str(s)
    }
}
