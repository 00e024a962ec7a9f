//! perpx execution bot.
//!
//! Wires the components into one process:
//! - JSON-RPC chain gateway with preflight checks
//! - Execution engine with durable operation log and restart recovery
//! - Newline-delimited JSON command interface on stdin/stdout
//! - Periodic liquidation-risk scan

pub mod app;
pub mod config;
pub mod error;
pub mod inbound;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use inbound::CommandHandler;
