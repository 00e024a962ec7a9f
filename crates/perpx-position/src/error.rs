//! Position error types.

use perpx_core::{CoreError, PositionKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Invalid delta for {key}: {source}")]
    InvalidDelta {
        key: PositionKey,
        #[source]
        source: CoreError,
    },

    #[error("Invalid position state: {0}")]
    InvalidState(String),
}

pub type PositionResult<T> = Result<T, PositionError>;
