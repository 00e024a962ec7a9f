//! Prometheus metrics and structured logging for perpx.
//!
//! - Structured logging with tracing (JSON in production, pretty otherwise)
//! - Prometheus metrics for intents, operation lifecycle, submissions,
//!   gateway timeouts and liquidation-risk flags

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
