//! Error types for perpx-core.

use crate::operation::OperationStatus;
use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid market id: {0}")]
    InvalidMarket(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
