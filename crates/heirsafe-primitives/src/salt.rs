use alloy_primitives::B256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Malformed salt in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaltError {
    #[error("salt must be exactly 64 hex characters, got {0}")]
    WrongLength(usize),
    #[error("salt contains non-hex characters")]
    NotHex,
}

/// The fixed 32-byte value parameterizing module address prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeploymentSalt(B256);

impl DeploymentSalt {
    pub const fn new(bytes: B256) -> Self {
        Self(bytes)
    }

    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl FromStr for DeploymentSalt {
    type Err = SaltError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        if digits.len() != 64 {
            return Err(SaltError::WrongLength(digits.len()));
        }
        let bytes = hex::decode(digits).map_err(|_| SaltError::NotHex)?;
        Ok(Self(B256::from_slice(&bytes)))
    }
}

impl fmt::Display for DeploymentSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for DeploymentSalt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeploymentSalt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
