//! Gateway error types.

use alloy::primitives::B256;
use thiserror::Error;

/// Outcome of a failed gateway call.
///
/// `Timeout` is kept distinct from transport failures so callers can retry
/// idempotently instead of treating a slow node as a rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{call} timed out after {timeout_ms}ms")]
    Timeout { call: &'static str, timeout_ms: u64 },

    #[error("nonce too low: {0}")]
    NonceTooLow(String),

    #[error("transaction underpriced: {0}")]
    Underpriced(String),

    #[error("transaction already in flight: {tx_hash}")]
    AlreadyInFlight { tx_hash: B256 },

    #[error("rejected by node: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }

    /// Timeouts and transport failures are worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::Transport(_)
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
