//! Positions and the margin math behind them.
//!
//! Conventions:
//! - `size` is in base units; deltas are USD notional converted at the
//!   execution price.
//! - `leverage = size * entry_price / collateral`
//! - Liquidation price is where losses consume the collateral:
//!   long `entry - collateral / size`, short `entry + collateral / size`.

use crate::decimal::{Price, Size};
use crate::error::{CoreError, Result};
use crate::types::{MarketId, PositionKey, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Projection
// ============================================================================

/// Hypothetical position state used for both settlement and risk checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Projection {
    pub size: Size,
    pub collateral: Decimal,
    pub entry_price: Price,
    /// PnL realized by the deltas applied to reach this projection.
    pub realized_pnl: Decimal,
}

impl Projection {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn from_position(position: Option<&Position>) -> Self {
        match position {
            Some(p) => Self {
                size: p.size,
                collateral: p.collateral,
                entry_price: p.entry_price,
                realized_pnl: Decimal::ZERO,
            },
            None => Self::flat(),
        }
    }

    #[inline]
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Apply a USD-notional delta executed at `price`.
    ///
    /// Reductions are capped at the current size; a reduction that consumes
    /// the whole size, or an explicit close, pays out collateral and
    /// realized PnL and leaves a flat projection.
    pub fn apply(
        &self,
        side: Side,
        size_delta: Decimal,
        collateral_delta: Decimal,
        price: Price,
        close: bool,
    ) -> Result<Projection> {
        if !price.is_positive() {
            return Err(CoreError::InvalidDelta(format!(
                "execution price must be positive, got {price}"
            )));
        }

        if close {
            return self.closed_at(side, self.size, price);
        }

        if size_delta > Decimal::ZERO {
            let added = Size::from_notional(size_delta, price)
                .ok_or_else(|| CoreError::InvalidDelta("size conversion failed".into()))?;
            let new_size = Size::new(checked(self.size.inner().checked_add(added.inner()), "size")?);
            let entry_price = if self.is_flat() {
                price
            } else {
                let current = checked(
                    self.size.inner().checked_mul(self.entry_price.inner()),
                    "notional",
                )?;
                let weighted = checked(current.checked_add(size_delta), "notional")?;
                Price::new(checked(weighted.checked_div(new_size.inner()), "entry price")?)
            };
            return Ok(Projection {
                size: new_size,
                collateral: checked(self.collateral.checked_add(collateral_delta), "collateral")?,
                entry_price,
                realized_pnl: self.realized_pnl,
            });
        }

        if size_delta < Decimal::ZERO {
            let requested = Size::from_notional(size_delta.abs(), price)
                .ok_or_else(|| CoreError::InvalidDelta("size conversion failed".into()))?;
            let reduced = requested.min(self.size);
            if reduced == self.size {
                return self.closed_at(side, reduced, price);
            }
            let realized = realized_pnl(side, reduced, self.entry_price, price)?;
            let collateral = self
                .collateral
                .checked_add(collateral_delta)
                .and_then(|c| c.checked_add(realized));
            return Ok(Projection {
                size: self.size - reduced,
                collateral: checked(collateral, "collateral")?,
                entry_price: self.entry_price,
                realized_pnl: checked(self.realized_pnl.checked_add(realized), "realized pnl")?,
            });
        }

        Ok(Projection {
            collateral: checked(self.collateral.checked_add(collateral_delta), "collateral")?,
            ..*self
        })
    }

    fn closed_at(&self, side: Side, reduced: Size, price: Price) -> Result<Projection> {
        let realized = if self.is_flat() {
            Decimal::ZERO
        } else {
            realized_pnl(side, reduced, self.entry_price, price)?
        };
        Ok(Projection {
            size: Size::ZERO,
            collateral: Decimal::ZERO,
            entry_price: Price::ZERO,
            realized_pnl: checked(self.realized_pnl.checked_add(realized), "realized pnl")?,
        })
    }

    /// Leverage against the notional at `mark`.
    ///
    /// `Some(0)` when flat, `None` when a non-flat projection has no
    /// positive collateral backing it.
    pub fn leverage_at(&self, mark: Price) -> Option<Decimal> {
        if self.is_flat() {
            return Some(Decimal::ZERO);
        }
        if self.collateral <= Decimal::ZERO {
            return None;
        }
        self.size.notional(mark).checked_div(self.collateral)
    }

    pub fn liquidation_price(&self, side: Side) -> Price {
        liquidation_price(side, self.entry_price, self.size, self.collateral)
    }
}

/// Price at which losses consume `collateral`. Zero for a flat position.
pub fn liquidation_price(side: Side, entry: Price, size: Size, collateral: Decimal) -> Price {
    if size.is_zero() {
        return Price::ZERO;
    }
    let per_unit = collateral.checked_div(size.inner()).unwrap_or(Decimal::MAX);
    let liq = match side {
        Side::Long => entry.inner().saturating_sub(per_unit),
        Side::Short => entry.inner().saturating_add(per_unit),
    };
    Price::new(liq.max(Decimal::ZERO))
}

fn realized_pnl(side: Side, size: Size, entry: Price, exit: Price) -> Result<Decimal> {
    let move_per_unit = checked(exit.inner().checked_sub(entry.inner()), "price move")?;
    let pnl = size.inner().checked_mul(move_per_unit);
    Ok(side.sign() * checked(pnl, "realized pnl")?)
}

fn checked(value: Option<Decimal>, what: &str) -> Result<Decimal> {
    value.ok_or_else(|| CoreError::Overflow(what.to_string()))
}

// ============================================================================
// Position
// ============================================================================

/// Settled position for one (market, side).
///
/// Only ever produced from a confirmed delta; speculative state lives in
/// `PendingAdjustment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market: MarketId,
    pub side: Side,
    pub size: Size,
    pub collateral: Decimal,
    pub entry_price: Price,
    pub leverage: Decimal,
    pub liquidation_price: Price,
    pub last_update_height: u64,
    /// Cumulative realized PnL over the position's life.
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.market.clone(), self.side)
    }

    #[inline]
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    pub fn notional(&self, mark: Price) -> Decimal {
        self.size.notional(mark)
    }

    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        let move_per_unit = mark.inner().saturating_sub(self.entry_price.inner());
        self.side.sign() * self.size.inner().saturating_mul(move_per_unit)
    }

    /// Collateral plus unrealized PnL at `mark`.
    pub fn equity(&self, mark: Price) -> Decimal {
        self.collateral.saturating_add(self.unrealized_pnl(mark))
    }

    /// Equity has fallen below the venue's minimum collateral.
    pub fn below_min_collateral(&self, mark: Price, min_collateral: Decimal) -> bool {
        !self.is_flat() && self.equity(mark) < min_collateral
    }

    /// Mark has crossed the liquidation price.
    pub fn liquidation_crossed(&self, mark: Price) -> bool {
        if self.is_flat() {
            return false;
        }
        match self.side {
            Side::Long => mark <= self.liquidation_price,
            Side::Short => mark >= self.liquidation_price,
        }
    }

    /// Settle `delta` on top of `current`.
    ///
    /// A delta that closes the position yields a flat snapshot carrying the
    /// final realized PnL.
    pub fn settle(current: Option<&Position>, delta: &PositionDelta, height: u64) -> Result<Position> {
        if let Some(p) = current {
            if p.market != delta.market || p.side != delta.side {
                return Err(CoreError::InvalidDelta(format!(
                    "delta for {}:{} applied to {}",
                    delta.market,
                    delta.side,
                    p.key()
                )));
            }
        }

        let projection = Projection::from_position(current).apply(
            delta.side,
            delta.size_delta,
            delta.collateral_delta,
            delta.price,
            delta.close,
        )?;

        let leverage = if projection.is_flat() {
            Decimal::ZERO
        } else if projection.collateral <= Decimal::ZERO {
            Decimal::MAX
        } else {
            projection
                .size
                .notional(projection.entry_price)
                .checked_div(projection.collateral)
                .unwrap_or(Decimal::MAX)
        };

        let prior_realized = current.map(|p| p.realized_pnl).unwrap_or_default();

        Ok(Position {
            market: delta.market.clone(),
            side: delta.side,
            size: projection.size,
            collateral: projection.collateral,
            entry_price: projection.entry_price,
            leverage,
            liquidation_price: projection.liquidation_price(delta.side),
            last_update_height: height,
            realized_pnl: prior_realized.saturating_add(projection.realized_pnl),
        })
    }
}

// ============================================================================
// Deltas
// ============================================================================

/// Change applied to a position when an operation confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDelta {
    pub market: MarketId,
    pub side: Side,
    /// USD notional, signed.
    pub size_delta: Decimal,
    /// Collateral in USD, signed.
    pub collateral_delta: Decimal,
    /// Execution price the notional converts at.
    pub price: Price,
    pub close: bool,
}

impl PositionDelta {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.market.clone(), self.side)
    }

    /// Same delta filled at a different price.
    #[must_use]
    pub fn at_price(&self, price: Price) -> Self {
        Self {
            price,
            ..self.clone()
        }
    }
}

/// Aggregate of in-flight deltas against one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PendingAdjustment {
    pub size_delta: Decimal,
    pub collateral_delta: Decimal,
    pub close: bool,
    pub operations: usize,
}

impl PendingAdjustment {
    pub fn add(&mut self, delta: &PositionDelta) {
        self.size_delta = self.size_delta.saturating_add(delta.size_delta);
        self.collateral_delta = self.collateral_delta.saturating_add(delta.collateral_delta);
        self.close |= delta.close;
        self.operations += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }

    /// Project the settled position forward by the in-flight deltas at `mark`.
    pub fn project(&self, current: Option<&Position>, side: Side, mark: Price) -> Result<Projection> {
        let base = Projection::from_position(current);
        if self.is_empty() {
            return Ok(base);
        }
        base.apply(side, self.size_delta, self.collateral_delta, mark, self.close)
    }
}
