//! Validated orders and rejection reasons.

use crate::decimal::{Price, Size};
use crate::position::PositionDelta;
use crate::types::{MarketId, PositionKey, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an intent does to its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Open,
    Increase,
    Decrease,
    Close,
}

impl OperationKind {
    /// Whether the operation adds exposure in the position's direction.
    pub fn adds_exposure(&self) -> bool {
        matches!(self, OperationKind::Open | OperationKind::Increase)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Open => "open",
            OperationKind::Increase => "increase",
            OperationKind::Decrease => "decrease",
            OperationKind::Close => "close",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the risk validator refused an intent.
///
/// Enumerated so callers can branch on the reason rather than parse text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    UnsupportedMarket { market: MarketId },
    MarketPriceUnavailable,
    LeverageExceeded { resulting: Decimal, max: Decimal },
    InsufficientCollateral { resulting: Decimal, min: Decimal },
    LiquidationBufferBreached { distance_bps: Decimal, required_bps: u32 },
    InconsistentDelta { kind: OperationKind, detail: String },
    NoOpenPosition,
    BelowMinNotional { notional: Decimal, min: Decimal },
    TooManyPositions { open: usize, max: usize },
    /// A size, collateral or price outside what the margin math can represent.
    ValueOutOfRange { detail: String },
    InvalidTriggerPrice { detail: String },
}

impl RejectReason {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnsupportedMarket { .. } => "unsupported_market",
            RejectReason::MarketPriceUnavailable => "market_price_unavailable",
            RejectReason::LeverageExceeded { .. } => "leverage_exceeded",
            RejectReason::InsufficientCollateral { .. } => "insufficient_collateral",
            RejectReason::LiquidationBufferBreached { .. } => "liquidation_buffer_breached",
            RejectReason::InconsistentDelta { .. } => "inconsistent_delta",
            RejectReason::NoOpenPosition => "no_open_position",
            RejectReason::BelowMinNotional { .. } => "below_min_notional",
            RejectReason::TooManyPositions { .. } => "too_many_positions",
            RejectReason::ValueOutOfRange { .. } => "value_out_of_range",
            RejectReason::InvalidTriggerPrice { .. } => "invalid_trigger_price",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnsupportedMarket { market } => write!(f, "unsupported market {market}"),
            RejectReason::MarketPriceUnavailable => write!(f, "market price unavailable"),
            RejectReason::LeverageExceeded { resulting, max } => {
                write!(f, "leverage {resulting} exceeds max {max}")
            }
            RejectReason::InsufficientCollateral { resulting, min } => {
                write!(f, "collateral {resulting} below min {min}")
            }
            RejectReason::LiquidationBufferBreached {
                distance_bps,
                required_bps,
            } => write!(
                f,
                "liquidation distance {distance_bps}bps below required {required_bps}bps"
            ),
            RejectReason::InconsistentDelta { kind, detail } => {
                write!(f, "inconsistent {kind} delta: {detail}")
            }
            RejectReason::NoOpenPosition => write!(f, "no open position"),
            RejectReason::BelowMinNotional { notional, min } => {
                write!(f, "notional {notional} below min {min}")
            }
            RejectReason::TooManyPositions { open, max } => {
                write!(f, "{open} open positions, max {max}")
            }
            RejectReason::ValueOutOfRange { detail } => write!(f, "value out of range: {detail}"),
            RejectReason::InvalidTriggerPrice { detail } => {
                write!(f, "invalid trigger price: {detail}")
            }
        }
    }
}

/// Position the order leaves behind if it confirms at the mark price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultingPosition {
    pub size: Size,
    pub collateral: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Price,
}

impl ResultingPosition {
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }
}

/// Intent after risk validation: classified, sized and price-bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedOrder {
    pub market: MarketId,
    pub side: Side,
    pub kind: OperationKind,
    /// USD notional, signed. Derived from the leverage target when the
    /// intent left it at zero.
    pub size_delta: Decimal,
    pub collateral_delta: Decimal,
    pub mark_price: Price,
    /// Worst execution price the venue may fill at.
    pub acceptable_price: Price,
    pub resulting: ResultingPosition,
    pub risk_version: u32,
    /// Take-profit trigger attached to the increase, if any.
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
}

impl NormalizedOrder {
    pub fn position_key(&self) -> PositionKey {
        PositionKey::new(self.market.clone(), self.side)
    }

    /// Delta applied to the book on confirmation, at the mark price.
    pub fn delta(&self) -> PositionDelta {
        PositionDelta {
            market: self.market.clone(),
            side: self.side,
            size_delta: self.size_delta,
            collateral_delta: self.collateral_delta,
            price: self.mark_price,
            close: self.kind == OperationKind::Close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reject_reason_serializes_tagged() {
        let reason = RejectReason::LeverageExceeded {
            resulting: dec!(12),
            max: dec!(10),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "leverage_exceeded");
        assert_eq!(reason.as_str(), "leverage_exceeded");
    }

    #[test]
    fn test_close_order_delta_sets_close_flag() {
        let order = NormalizedOrder {
            market: MarketId::parse("BTCUSDT").unwrap(),
            side: Side::Long,
            kind: OperationKind::Close,
            size_delta: dec!(-1000),
            collateral_delta: dec!(-200),
            mark_price: Price::new(dec!(100)),
            acceptable_price: Price::new(dec!(99)),
            resulting: ResultingPosition {
                size: Size::ZERO,
                collateral: Decimal::ZERO,
                leverage: Decimal::ZERO,
                liquidation_price: Price::ZERO,
            },
            risk_version: 1,
            take_profit: None,
            stop_loss: None,
        };

        let delta = order.delta();
        assert!(delta.close);
        assert_eq!(delta.price.inner(), dec!(100));
        assert!(order.resulting.is_flat());
    }
}
