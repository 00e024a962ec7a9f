//! Execution layer for perpx.
//!
//! Turns validated trade intents into signed transactions, broadcasts them
//! through the chain client and follows them to a terminal status.
//!
//! # Key Components
//!
//! - [`ExecutionEngine`]: intake, per-position serialization, replacement
//!   and cancellation, restart from the operation log
//! - [`NonceLedger`]: gap-free nonce allocation per account
//! - [`TxSigner`] / [`KeyManager`]: trading key and transaction signing
//! - [`PayloadBuilder`]: router calldata for normalized orders
//! - [`OrderTracker`]: receipt polling with backoff and a drop horizon

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod nonce;
pub mod payload;
pub mod sequencer;
pub mod signer;
pub mod tracker;

pub use config::{EngineConfig, ExecutionConfig, TrackerConfig};
pub use engine::{EngineDeps, ExecutionEngine, ResumeSummary};
pub use error::{ExecutionError, ExecutionResult};
pub use nonce::NonceLedger;
pub use payload::PayloadBuilder;
pub use sequencer::{KeyedSequencer, Ticket, Turn};
pub use signer::{KeyError, KeyManager, KeySource, SignerError, TxSigner};
pub use tracker::{OrderTracker, TrackOutcome};
