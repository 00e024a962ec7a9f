//! Executor error types.

use perpx_chain::GatewayError;
use perpx_core::{FailureReason, OperationId, OperationStatus, RejectReason};
use thiserror::Error;

/// Errors surfaced to callers of the execution engine.
///
/// Nonce conflicts are resolved inside the engine through the replacement
/// cycle and never appear here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Validation rejected: {0}")]
    ValidationRejected(RejectReason),

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("Network timeout during {call}")]
    NetworkTimeout { call: String },

    #[error("Chain reverted {tx_hash}: {reason}")]
    ChainReverted { tx_hash: String, reason: String },

    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("Duplicate intent: operation {operation_id} is {status}")]
    DuplicateIntent {
        operation_id: OperationId,
        status: OperationStatus,
    },

    #[error("Not confirmed after {replacements} replacements")]
    RetriesExhausted { replacements: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation interrupted before submission")]
    Interrupted,

    #[error("Unknown operation: {0}")]
    UnknownOperation(OperationId),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timed out waiting for operation {0}")]
    WaitTimeout(OperationId),
}

impl From<&FailureReason> for ExecutionError {
    fn from(reason: &FailureReason) -> Self {
        match reason {
            FailureReason::ValidationRejected { reason } => {
                ExecutionError::ValidationRejected(reason.clone())
            }
            FailureReason::SigningUnavailable { detail } => {
                ExecutionError::SigningUnavailable(detail.clone())
            }
            FailureReason::NetworkTimeout { call } => ExecutionError::NetworkTimeout { call: call.clone() },
            FailureReason::ChainReverted { tx_hash, reason } => ExecutionError::ChainReverted {
                tx_hash: tx_hash.clone(),
                reason: reason.clone(),
            },
            FailureReason::SubmissionRejected { detail } => {
                ExecutionError::SubmissionRejected(detail.clone())
            }
            FailureReason::RetriesExhausted { replacements } => ExecutionError::RetriesExhausted {
                replacements: *replacements,
            },
            FailureReason::PersistenceFailed { detail } => ExecutionError::Persistence(detail.clone()),
            FailureReason::Interrupted => ExecutionError::Interrupted,
        }
    }
}

impl ExecutionError {
    /// Stable label for responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::ValidationRejected(_) => "validation_rejected",
            ExecutionError::SigningUnavailable(_) => "signing_unavailable",
            ExecutionError::NetworkTimeout { .. } => "network_timeout",
            ExecutionError::ChainReverted { .. } => "chain_reverted",
            ExecutionError::SubmissionRejected(_) => "submission_rejected",
            ExecutionError::DuplicateIntent { .. } => "duplicate_intent",
            ExecutionError::RetriesExhausted { .. } => "retries_exhausted",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::Interrupted => "interrupted",
            ExecutionError::UnknownOperation(_) => "unknown_operation",
            ExecutionError::InvalidIntent(_) => "invalid_intent",
            ExecutionError::Gateway(_) => "gateway",
            ExecutionError::Persistence(_) => "persistence",
            ExecutionError::WaitTimeout(_) => "wait_timeout",
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
