//! Risk validation for perpx.
//!
//! Pure function layer: checks a proposed intent against the settled
//! position, the aggregate of in-flight deltas and the venue's risk
//! parameters. Performs no I/O.
//!
//! Checks, short-circuiting on the first failure:
//! 1. Market supported and mark price available
//! 2. Resulting leverage within `max_leverage`
//! 3. Resulting collateral at least `min_collateral`
//! 4. Liquidation price at least `liquidation_buffer_bps` from mark
//! 5. Delta signs consistent with side and operation kind
//! 6. Minimum position notional, then maximum open positions

pub mod error;
pub mod validator;

pub use error::{RejectReason, RiskResult};
pub use validator::{classify, validate, MarketContext, RiskValidator};
