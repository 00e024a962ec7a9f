//! Core domain types for the perpx execution engine.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - `Price`, `Size`: Precision-safe numeric types
//! - `MarketId`, `Side`, `PositionKey`: Position addressing
//! - `TradeIntent`: Strongly-typed caller request (parsed at the boundary)
//! - `Position`, `PositionDelta`: Settled exposure and the margin math behind it
//! - `NormalizedOrder`, `RejectReason`: Risk validator output
//! - `OperationRecord`, `OperationStatus`: Per-operation lifecycle state
//! - `RiskParameters`: Versioned venue risk configuration

pub mod decimal;
pub mod error;
pub mod fee;
pub mod intent;
pub mod operation;
pub mod order;
pub mod position;
pub mod risk_params;
pub mod types;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use fee::FeeQuote;
pub use intent::{IdempotencyKey, TradeIntent};
pub use operation::{
    FailureReason, OperationId, OperationRecord, OperationStatus, OperationView,
};
pub use order::{NormalizedOrder, OperationKind, RejectReason, ResultingPosition};
pub use position::{PendingAdjustment, Position, PositionDelta, Projection};
pub use risk_params::{EffectiveRisk, MarketRiskOverride, RiskParameters};
pub use types::{MarketId, PositionKey, Side};
