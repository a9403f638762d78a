use alloy_primitives::Address;
use thiserror::Error;

/// Failures of chain queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Transport failure or node error. Retried by the next poll.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The queried address does not implement the expected interface.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The call executed and reverted.
    #[error("execution reverted: {reason}")]
    Reverted { reason: String },

    /// The factory has no code on the active network.
    #[error("factory {factory} has no deployed code on this network")]
    FactoryUnreachable { factory: Address },
}

impl ChainError {
    /// Whether the next poll may succeed without any user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_))
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkUnavailable(e.to_string())
    }
}

/// Result type for chain queries.
pub type ChainResult<T> = Result<T, ChainError>;

/// Human-readable reason for a revert payload.
///
/// Decodes `Error(string)` and `Panic(uint256)`; anything else is returned as hex.
pub fn decode_revert(data: &[u8]) -> String {
    if data.is_empty() {
        return "reverted without reason".to_string();
    }
    alloy_sol_types::decode_revert_reason(data).unwrap_or_else(|| format!("0x{}", hex::encode(data)))
}
