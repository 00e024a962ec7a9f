//! Position book.
//!
//! # State
//!
//! - `positions`: settled positions, keyed by (market, side). Only ever
//!   written by [`PositionBook::apply_confirmed`] or
//!   [`PositionBook::restore_confirmed`].
//! - `pending`: deltas of operations that may still land on chain. Risk
//!   checks see them as an aggregate adjustment; they are never merged
//!   into settled fields.
//! - `applied`: resulting position per confirmed operation id, so a second
//!   confirmation event for the same operation is a no-op.
//!
//! Reads are lock-free DashMap lookups. Writes are serialized per account
//! by `write_lock`; the book holds exactly one account.

use dashmap::DashMap;
use parking_lot::Mutex;
use perpx_core::{
    MarketId, OperationId, PendingAdjustment, Position, PositionDelta, PositionKey, Price,
    RiskParameters, Side,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PositionError, PositionResult};

// ============================================================================
// Liquidation scan
// ============================================================================

/// Why a position was flagged by the liquidation scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationRisk {
    /// Collateral plus unrealized PnL fell below the minimum collateral.
    BelowMinCollateral,
    /// Mark price crossed the liquidation price.
    PastLiquidationPrice,
}

impl LiquidationRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidationRisk::BelowMinCollateral => "below_min_collateral",
            LiquidationRisk::PastLiquidationPrice => "past_liquidation_price",
        }
    }
}

/// A position at risk of venue liquidation. Detection only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiquidationFlag {
    pub position: Position,
    pub mark_price: Price,
    pub equity: Decimal,
    pub risk: LiquidationRisk,
}

// ============================================================================
// PositionBook
// ============================================================================

/// Settled and pending position state for one signing account.
#[derive(Debug)]
pub struct PositionBook {
    account: String,
    positions: DashMap<PositionKey, Position>,
    pending: DashMap<OperationId, PositionDelta>,
    applied: DashMap<OperationId, Position>,
    write_lock: Mutex<()>,
}

impl PositionBook {
    #[must_use]
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            positions: DashMap::new(),
            pending: DashMap::new(),
            applied: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    #[must_use]
    pub fn get_position(&self, market: &MarketId, side: Side) -> Option<Position> {
        self.positions
            .get(&PositionKey::new(market.clone(), side))
            .map(|p| p.clone())
    }

    /// Aggregate of in-flight deltas against (market, side).
    #[must_use]
    pub fn get_pending_adjustment(&self, market: &MarketId, side: Side) -> PendingAdjustment {
        let mut adjustment = PendingAdjustment::default();
        for entry in self.pending.iter() {
            let delta = entry.value();
            if delta.side == side && &delta.market == market {
                adjustment.add(delta);
            }
        }
        adjustment
    }

    /// Resulting position recorded for a confirmed operation.
    #[must_use]
    pub fn applied_result(&self, operation_id: &OperationId) -> Option<Position> {
        self.applied.get(operation_id).map(|p| p.clone())
    }

    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.iter().map(|p| p.clone()).collect();
        positions.sort_by_key(Position::key);
        positions
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Pending deltas
    // ------------------------------------------------------------------

    /// Make `delta` visible to risk checks as an in-flight adjustment.
    pub fn register_pending(&self, operation_id: OperationId, delta: PositionDelta) {
        debug!(
            %operation_id,
            key = %delta.key(),
            size_delta = %delta.size_delta,
            collateral_delta = %delta.collateral_delta,
            "Pending delta registered"
        );
        self.pending.insert(operation_id, delta);
    }

    /// Drop the in-flight delta of an operation that will not confirm.
    pub fn clear_pending(&self, operation_id: &OperationId) -> Option<PositionDelta> {
        self.pending.remove(operation_id).map(|(_, d)| d)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Settle a confirmed operation's delta.
    ///
    /// Idempotent per `operation_id`: a repeated confirmation returns the
    /// position recorded the first time and leaves the book untouched.
    pub fn apply_confirmed(
        &self,
        operation_id: OperationId,
        delta: &PositionDelta,
        height: u64,
    ) -> PositionResult<Position> {
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.applied.get(&operation_id) {
            debug!(%operation_id, "Confirmation already applied");
            return Ok(existing.clone());
        }

        let key = delta.key();
        let current = self.positions.get(&key).map(|p| p.clone());
        let result = Position::settle(current.as_ref(), delta, height)
            .map_err(|source| PositionError::InvalidDelta { key: key.clone(), source })?;

        if result.is_flat() {
            self.positions.remove(&key);
        } else {
            self.positions.insert(key.clone(), result.clone());
        }
        self.applied.insert(operation_id, result.clone());
        self.pending.remove(&operation_id);

        info!(
            %operation_id,
            %key,
            size = %result.size,
            collateral = %result.collateral,
            leverage = %result.leverage,
            liquidation_price = %result.liquidation_price,
            height,
            "Position updated"
        );

        Ok(result)
    }

    /// Restore a confirmed operation's resulting position from the
    /// operation log.
    ///
    /// Snapshots older than the position already held for the same key
    /// are recorded as applied but do not overwrite it.
    pub fn restore_confirmed(&self, operation_id: OperationId, position: Position) -> PositionResult<()> {
        let _guard = self.write_lock.lock();

        if self.applied.contains_key(&operation_id) {
            return Ok(());
        }
        if position.size.inner().is_sign_negative() {
            return Err(PositionError::InvalidState(format!(
                "negative size in restored position {}",
                position.key()
            )));
        }

        let key = position.key();
        let newer_held = self
            .positions
            .get(&key)
            .is_some_and(|p| p.last_update_height > position.last_update_height);

        if !newer_held {
            if position.is_flat() {
                self.positions.remove(&key);
            } else {
                self.positions.insert(key, position.clone());
            }
        }
        self.applied.insert(operation_id, position);
        Ok(())
    }

    /// Flag positions whose equity or mark breached their limits.
    ///
    /// `mark_of` supplies the current mark per market; positions without a
    /// mark are skipped.
    pub fn scan_liquidation_risk<F>(&self, mark_of: F, params: &RiskParameters) -> Vec<LiquidationFlag>
    where
        F: Fn(&MarketId) -> Option<Price>,
    {
        let mut flags = Vec::new();
        for position in self.open_positions() {
            let Some(mark) = mark_of(&position.market) else {
                continue;
            };
            let min_collateral = params.for_market(&position.market).min_collateral;
            let equity = position.equity(mark);

            let risk = if position.liquidation_crossed(mark) {
                Some(LiquidationRisk::PastLiquidationPrice)
            } else if position.below_min_collateral(mark, min_collateral) {
                Some(LiquidationRisk::BelowMinCollateral)
            } else {
                None
            };

            if let Some(risk) = risk {
                warn!(
                    key = %position.key(),
                    %mark,
                    %equity,
                    %min_collateral,
                    liquidation_price = %position.liquidation_price,
                    risk = risk.as_str(),
                    "Position at liquidation risk"
                );
                flags.push(LiquidationFlag {
                    position,
                    mark_price: mark,
                    equity,
                    risk,
                });
            }
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpx_core::Size;
    use rust_decimal_macros::dec;

    fn btc() -> MarketId {
        MarketId::parse("BTCUSDT").unwrap()
    }

    fn open_delta(size: Decimal, collateral: Decimal, price: Decimal) -> PositionDelta {
        PositionDelta {
            market: btc(),
            side: Side::Long,
            size_delta: size,
            collateral_delta: collateral,
            price: Price::new(price),
            close: false,
        }
    }

    #[test]
    fn test_apply_confirmed_creates_position() {
        let book = PositionBook::new("0xabc");
        let op = OperationId::new();

        let pos = book
            .apply_confirmed(op, &open_delta(dec!(5000), dec!(1000), dec!(2000)), 7)
            .unwrap();

        assert_eq!(pos.size, Size::new(dec!(2.5)));
        assert_eq!(pos.leverage, dec!(5));
        assert_eq!(book.get_position(&btc(), Side::Long), Some(pos));
        assert!(book.get_position(&btc(), Side::Short).is_none());
        assert_eq!(book.open_count(), 1);
    }

    #[test]
    fn test_apply_confirmed_is_idempotent() {
        let book = PositionBook::new("0xabc");
        let op = OperationId::new();
        let delta = open_delta(dec!(5000), dec!(1000), dec!(2000));

        let first = book.apply_confirmed(op, &delta, 7).unwrap();
        let second = book.apply_confirmed(op, &delta, 9).unwrap();

        assert_eq!(first, second);
        assert_eq!(book.get_position(&btc(), Side::Long), Some(first));
    }

    #[test]
    fn test_pending_is_aggregated_and_cleared_on_confirm() {
        let book = PositionBook::new("0xabc");
        let a = OperationId::new();
        let b = OperationId::new();
        book.register_pending(a, open_delta(dec!(1000), dec!(100), dec!(2000)));
        book.register_pending(b, open_delta(dec!(500), dec!(50), dec!(2000)));

        let pending = book.get_pending_adjustment(&btc(), Side::Long);
        assert_eq!(pending.size_delta, dec!(1500));
        assert_eq!(pending.collateral_delta, dec!(150));
        assert_eq!(pending.operations, 2);
        assert!(book.get_pending_adjustment(&btc(), Side::Short).is_empty());

        // Pending deltas never touch the settled position
        assert!(book.get_position(&btc(), Side::Long).is_none());

        book.apply_confirmed(a, &open_delta(dec!(1000), dec!(100), dec!(2000)), 1)
            .unwrap();
        assert_eq!(book.get_pending_adjustment(&btc(), Side::Long).operations, 1);

        book.clear_pending(&b);
        assert_eq!(book.pending_count(), 0);
    }

    #[test]
    fn test_close_removes_position() {
        let book = PositionBook::new("0xabc");
        book.apply_confirmed(OperationId::new(), &open_delta(dec!(5000), dec!(1000), dec!(2000)), 1)
            .unwrap();

        let mut close = open_delta(Decimal::ZERO, Decimal::ZERO, dec!(2100));
        close.close = true;
        let op = OperationId::new();
        let flat = book.apply_confirmed(op, &close, 2).unwrap();

        assert!(flat.is_flat());
        assert_eq!(flat.realized_pnl, dec!(250));
        assert!(book.get_position(&btc(), Side::Long).is_none());
        assert_eq!(book.applied_result(&op), Some(flat));
    }

    #[test]
    fn test_restore_keeps_newest_snapshot() {
        let book = PositionBook::new("0xabc");
        let newer = Position::settle(None, &open_delta(dec!(6000), dec!(1000), dec!(2000)), 20).unwrap();
        let older = Position::settle(None, &open_delta(dec!(5000), dec!(1000), dec!(2000)), 10).unwrap();

        book.restore_confirmed(OperationId::new(), newer.clone()).unwrap();
        book.restore_confirmed(OperationId::new(), older).unwrap();

        assert_eq!(book.get_position(&btc(), Side::Long), Some(newer));
    }

    #[test]
    fn test_scan_flags_below_min_collateral() {
        let book = PositionBook::new("0xabc");
        // 2.5 units at 2000, 1000 collateral, liq 1600
        book.apply_confirmed(OperationId::new(), &open_delta(dec!(5000), dec!(1000), dec!(2000)), 1)
            .unwrap();
        let params = RiskParameters {
            min_collateral: dec!(100),
            ..RiskParameters::default()
        };

        assert!(book
            .scan_liquidation_risk(|_| Some(Price::new(dec!(1900))), &params)
            .is_empty());

        // equity = 1000 - 2.5 * 370 = 75 < 100
        let flags = book.scan_liquidation_risk(|_| Some(Price::new(dec!(1630))), &params);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].risk, LiquidationRisk::BelowMinCollateral);
        assert_eq!(flags[0].equity, dec!(75));

        let flags = book.scan_liquidation_risk(|_| Some(Price::new(dec!(1590))), &params);
        assert_eq!(flags[0].risk, LiquidationRisk::PastLiquidationPrice);

        assert!(book.scan_liquidation_risk(|_| None, &params).is_empty());
    }
}
