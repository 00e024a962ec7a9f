//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] perpx_chain::GatewayError),

    #[error("Key error: {0}")]
    Key(#[from] perpx_executor::KeyError),

    #[error("Execution error: {0}")]
    Execution(#[from] perpx_executor::ExecutionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] perpx_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] perpx_persistence::PersistenceError),

    #[error("Preflight error: {0}")]
    Preflight(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
