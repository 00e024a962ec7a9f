//! Position book for perpx.
//!
//! In-memory authoritative view of one account's settled positions and the
//! deltas of its in-flight operations.
//!
//! # Key Components
//!
//! - [`PositionBook`]: settled positions, pending adjustments and the
//!   idempotent `apply_confirmed` write path
//! - [`LiquidationFlag`]: a position whose equity or mark price breached
//!   its limits during a scan

pub mod book;
pub mod error;

pub use book::{LiquidationFlag, LiquidationRisk, PositionBook};
pub use error::{PositionError, PositionResult};
