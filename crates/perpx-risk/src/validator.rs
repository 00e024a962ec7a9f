//! Intent validation.

use std::sync::Arc;

use perpx_core::{
    CoreError, NormalizedOrder, OperationKind, PendingAdjustment, Position, Price, Projection,
    ResultingPosition, RiskParameters, Side, TradeIntent,
};
use rust_decimal::Decimal;

use crate::error::{RejectReason, RiskResult};

/// Market-wide inputs to a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketContext {
    pub mark_price: Price,
    /// Positions currently open on the account, across all markets.
    pub open_positions: usize,
}

/// Holds the immutable parameter set the engine validates against.
#[derive(Debug, Clone)]
pub struct RiskValidator {
    params: Arc<RiskParameters>,
}

impl RiskValidator {
    #[must_use]
    pub fn new(params: Arc<RiskParameters>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    pub fn validate(
        &self,
        intent: &TradeIntent,
        current: Option<&Position>,
        pending: &PendingAdjustment,
        market: &MarketContext,
    ) -> RiskResult<NormalizedOrder> {
        validate(intent, current, pending, &self.params, market)
    }
}

/// Classify what `size_delta` does to the projected base position.
///
/// `size_delta` must already include any leverage-derived size.
pub fn classify(intent: &TradeIntent, base: &Projection, size_delta: Decimal, mark: Price) -> OperationKind {
    if intent.close {
        return OperationKind::Close;
    }
    if base.is_flat() {
        return OperationKind::Open;
    }
    if size_delta > Decimal::ZERO {
        return OperationKind::Increase;
    }
    if size_delta < Decimal::ZERO {
        return if size_delta.abs() >= base.size.notional(mark) {
            OperationKind::Close
        } else {
            OperationKind::Decrease
        };
    }
    if intent.collateral_delta < Decimal::ZERO {
        OperationKind::Decrease
    } else {
        OperationKind::Increase
    }
}

/// Validate `intent` against the settled position and in-flight deltas.
pub fn validate(
    intent: &TradeIntent,
    current: Option<&Position>,
    pending: &PendingAdjustment,
    params: &RiskParameters,
    market: &MarketContext,
) -> RiskResult<NormalizedOrder> {
    if !params.is_supported(&intent.market) {
        return Err(RejectReason::UnsupportedMarket {
            market: intent.market.clone(),
        });
    }
    let mark = market.mark_price;
    if !mark.is_positive() {
        return Err(RejectReason::MarketPriceUnavailable);
    }
    let limits = params.for_market(&intent.market);
    let side = intent.side;

    let base = pending.project(current, side, mark).map_err(projection_error)?;

    let mut size_delta = intent.size_delta;
    if size_delta.is_zero() && !intent.close && intent.collateral_delta > Decimal::ZERO {
        if let Some(leverage) = intent.leverage_target {
            size_delta = intent.collateral_delta.checked_mul(leverage).ok_or_else(|| {
                RejectReason::ValueOutOfRange {
                    detail: format!("{} collateral at {leverage}x", intent.collateral_delta),
                }
            })?;
        }
    }

    let kind = classify(intent, &base, size_delta, mark);

    // A close pays out everything the projected position holds.
    let (size_delta, collateral_delta) = if kind == OperationKind::Close {
        (-base.size.notional(mark), -base.collateral)
    } else {
        (size_delta, intent.collateral_delta)
    };

    let resulting = base
        .apply(side, size_delta, collateral_delta, mark, kind == OperationKind::Close)
        .map_err(projection_error)?;
    let leverage = resulting.leverage_at(mark);
    let liquidation_price = resulting.liquidation_price(side);

    if !resulting.is_flat() {
        // (a) leverage; a position with no collateral behind it has none
        match leverage {
            Some(lev) if lev > limits.max_leverage => {
                return Err(RejectReason::LeverageExceeded {
                    resulting: lev,
                    max: limits.max_leverage,
                });
            }
            Some(_) => {}
            None => {
                return Err(RejectReason::InsufficientCollateral {
                    resulting: resulting.collateral,
                    min: limits.min_collateral,
                });
            }
        }

        // (b) collateral
        if resulting.collateral < limits.min_collateral {
            return Err(RejectReason::InsufficientCollateral {
                resulting: resulting.collateral,
                min: limits.min_collateral,
            });
        }

        // (c) liquidation buffer
        let wrong_side = match side {
            Side::Long => liquidation_price >= mark,
            Side::Short => liquidation_price <= mark,
        };
        let distance_bps = if wrong_side {
            Decimal::ZERO
        } else {
            liquidation_price.distance_bps(mark).unwrap_or_default()
        };
        if distance_bps < Decimal::from(limits.liquidation_buffer_bps) {
            return Err(RejectReason::LiquidationBufferBreached {
                distance_bps: distance_bps.round_dp(2),
                required_bps: limits.liquidation_buffer_bps,
            });
        }
    }

    // (d) sign consistency
    check_signs(kind, &base, size_delta, collateral_delta)?;

    // (e) notional floor and position count
    if !resulting.is_flat() {
        let notional = resulting.size.notional(mark);
        if notional < limits.min_position_notional {
            return Err(RejectReason::BelowMinNotional {
                notional: notional.round_dp(8),
                min: limits.min_position_notional,
            });
        }
    }
    if kind == OperationKind::Open
        && current.is_none()
        && market.open_positions >= params.max_open_positions
    {
        return Err(RejectReason::TooManyPositions {
            open: market.open_positions,
            max: params.max_open_positions,
        });
    }

    check_triggers(intent, kind, mark)?;

    // Buys fill up, sells fill down.
    let buying = kind.adds_exposure() == side.is_long();
    let acceptable_price = mark.shifted_bps(intent.max_slippage_bps, buying);

    Ok(NormalizedOrder {
        market: intent.market.clone(),
        side,
        kind,
        size_delta,
        collateral_delta,
        mark_price: mark,
        acceptable_price,
        resulting: ResultingPosition {
            size: resulting.size,
            collateral: resulting.collateral,
            leverage: leverage.unwrap_or_default(),
            liquidation_price,
        },
        risk_version: params.version,
        take_profit: intent.take_profit,
        stop_loss: intent.stop_loss,
    })
}

fn projection_error(err: CoreError) -> RejectReason {
    match err {
        CoreError::Overflow(detail) => RejectReason::ValueOutOfRange { detail },
        _ => RejectReason::MarketPriceUnavailable,
    }
}

/// Take-profit must sit on the winning side of the mark and stop-loss on the
/// losing side. Triggers only ride on orders that add exposure.
fn check_triggers(intent: &TradeIntent, kind: OperationKind, mark: Price) -> RiskResult<()> {
    if intent.take_profit.is_none() && intent.stop_loss.is_none() {
        return Ok(());
    }
    let invalid = |detail: String| RejectReason::InvalidTriggerPrice { detail };
    if !kind.adds_exposure() {
        return Err(invalid(format!("triggers cannot be attached to a {kind}")));
    }
    let long = intent.side.is_long();
    if let Some(tp) = intent.take_profit {
        if (long && tp <= mark) || (!long && tp >= mark) {
            return Err(invalid(format!(
                "take profit {tp} on the wrong side of mark {mark}"
            )));
        }
    }
    if let Some(sl) = intent.stop_loss {
        if (long && sl >= mark) || (!long && sl <= mark) {
            return Err(invalid(format!("stop loss {sl} on the wrong side of mark {mark}")));
        }
    }
    Ok(())
}

fn check_signs(
    kind: OperationKind,
    base: &Projection,
    size_delta: Decimal,
    collateral_delta: Decimal,
) -> RiskResult<()> {
    let inconsistent = |detail: &str| RejectReason::InconsistentDelta {
        kind,
        detail: detail.to_string(),
    };

    match kind {
        OperationKind::Open => {
            if size_delta <= Decimal::ZERO {
                return Err(inconsistent("open requires a positive size or leverage target"));
            }
            if collateral_delta <= Decimal::ZERO {
                return Err(inconsistent("open requires positive collateral"));
            }
        }
        OperationKind::Increase => {
            if size_delta < Decimal::ZERO || collateral_delta < Decimal::ZERO {
                return Err(inconsistent("increase cannot carry negative deltas"));
            }
            if size_delta.is_zero() && collateral_delta.is_zero() {
                return Err(inconsistent("empty delta"));
            }
        }
        OperationKind::Decrease => {
            if size_delta > Decimal::ZERO || collateral_delta > Decimal::ZERO {
                return Err(inconsistent("decrease cannot carry positive deltas"));
            }
        }
        OperationKind::Close => {
            if base.is_flat() {
                return Err(RejectReason::NoOpenPosition);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpx_core::{IdempotencyKey, MarketId, PositionDelta, Size};
    use rust_decimal_macros::dec;

    fn btc() -> MarketId {
        MarketId::parse("BTCUSDT").unwrap()
    }

    fn key() -> IdempotencyKey {
        IdempotencyKey::new("k-1").unwrap()
    }

    fn params(max_leverage: Decimal) -> RiskParameters {
        RiskParameters {
            max_leverage,
            ..RiskParameters::default()
        }
    }

    fn ctx(mark: Decimal) -> MarketContext {
        MarketContext {
            mark_price: Price::new(mark),
            open_positions: 0,
        }
    }

    fn long_position(size_usd: Decimal, collateral: Decimal, price: Decimal) -> Position {
        Position::settle(
            None,
            &PositionDelta {
                market: btc(),
                side: Side::Long,
                size_delta: size_usd,
                collateral_delta: collateral,
                price: Price::new(price),
                close: false,
            },
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_five_x_open_is_accepted() {
        let intent = TradeIntent::open(btc(), Side::Long, dec!(1000), dec!(5), 50, key());
        let order = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &params(dec!(10)),
            &ctx(dec!(2000)),
        )
        .unwrap();

        assert_eq!(order.kind, OperationKind::Open);
        assert_eq!(order.size_delta, dec!(5000));
        assert_eq!(order.resulting.size, Size::new(dec!(2.5)));
        assert_eq!(order.resulting.leverage, dec!(5));
        assert_eq!(order.resulting.liquidation_price, Price::new(dec!(1600)));
        assert_eq!(order.acceptable_price, Price::new(dec!(2010)));
    }

    #[test]
    fn test_twelve_x_is_leverage_exceeded() {
        let intent = TradeIntent::open(btc(), Side::Long, dec!(1000), dec!(12), 50, key());
        let err = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &params(dec!(10)),
            &ctx(dec!(2000)),
        )
        .unwrap_err();

        assert_eq!(
            err,
            RejectReason::LeverageExceeded {
                resulting: dec!(12),
                max: dec!(10)
            }
        );
    }

    #[test]
    fn test_pending_adjustment_counts_toward_leverage() {
        let current = long_position(dec!(5000), dec!(1000), dec!(2000));
        let mut pending = PendingAdjustment::default();
        pending.add(&PositionDelta {
            market: btc(),
            side: Side::Long,
            size_delta: dec!(4000),
            collateral_delta: Decimal::ZERO,
            price: Price::new(dec!(2000)),
            close: false,
        });

        // 5000 + 4000 + 2000 = 11000 on 1000 collateral
        let mut intent = TradeIntent::open(btc(), Side::Long, Decimal::ZERO, dec!(1), 50, key());
        intent.size_delta = dec!(2000);
        intent.leverage_target = None;

        let err = validate(&intent, Some(&current), &pending, &params(dec!(10)), &ctx(dec!(2000)))
            .unwrap_err();
        assert!(matches!(err, RejectReason::LeverageExceeded { .. }));

        // Without the in-flight delta the same intent is fine
        let order = validate(
            &intent,
            Some(&current),
            &PendingAdjustment::default(),
            &params(dec!(10)),
            &ctx(dec!(2000)),
        )
        .unwrap();
        assert_eq!(order.kind, OperationKind::Increase);
    }

    #[test]
    fn test_insufficient_collateral() {
        let intent = TradeIntent::open(btc(), Side::Long, dec!(10), dec!(5), 50, key());
        let err = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap_err();
        assert!(matches!(err, RejectReason::InsufficientCollateral { .. }));
    }

    #[test]
    fn test_liquidation_buffer() {
        let p = RiskParameters {
            liquidation_buffer_bps: 1_000,
            ..RiskParameters::default()
        };
        // 20x: liquidation 5% away, below a 10% buffer
        let intent = TradeIntent::open(btc(), Side::Short, dec!(100), dec!(20), 50, key());
        let err = validate(&intent, None, &PendingAdjustment::default(), &p, &ctx(dec!(2000)))
            .unwrap_err();
        assert_eq!(
            err,
            RejectReason::LiquidationBufferBreached {
                distance_bps: dec!(500),
                required_bps: 1_000
            }
        );
    }

    #[test]
    fn test_close_without_position() {
        let intent = TradeIntent::close(btc(), Side::Long, 50, key());
        let err = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap_err();
        assert_eq!(err, RejectReason::NoOpenPosition);
    }

    #[test]
    fn test_close_pays_out_position() {
        let current = long_position(dec!(5000), dec!(1000), dec!(2000));
        let intent = TradeIntent::close(btc(), Side::Long, 100, key());
        let order = validate(
            &intent,
            Some(&current),
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap();

        assert_eq!(order.kind, OperationKind::Close);
        assert_eq!(order.size_delta, dec!(-5000));
        assert_eq!(order.collateral_delta, dec!(-1000));
        assert!(order.resulting.is_flat());
        // Selling out of a long fills down
        assert_eq!(order.acceptable_price, Price::new(dec!(1980)));
    }

    #[test]
    fn test_full_reduction_is_close() {
        let current = long_position(dec!(5000), dec!(1000), dec!(2000));
        let mut intent = TradeIntent::close(btc(), Side::Long, 100, key());
        intent.close = false;
        intent.size_delta = dec!(-6000);

        let order = validate(
            &intent,
            Some(&current),
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap();
        assert_eq!(order.kind, OperationKind::Close);
    }

    #[test]
    fn test_decrease_with_positive_collateral_is_inconsistent() {
        let current = long_position(dec!(5000), dec!(1000), dec!(2000));
        let mut intent = TradeIntent::close(btc(), Side::Long, 100, key());
        intent.close = false;
        intent.size_delta = dec!(-1000);
        intent.collateral_delta = dec!(10);

        let err = validate(
            &intent,
            Some(&current),
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RejectReason::InconsistentDelta {
                kind: OperationKind::Decrease,
                ..
            }
        ));
    }

    #[test]
    fn test_open_without_size_is_inconsistent() {
        let mut intent = TradeIntent::open(btc(), Side::Long, dec!(1000), dec!(5), 50, key());
        intent.leverage_target = None;
        let err = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap_err();
        assert!(matches!(err, RejectReason::InconsistentDelta { .. }));
    }

    #[test]
    fn test_unsupported_market_and_missing_price() {
        let p = RiskParameters {
            supported_markets: vec![MarketId::parse("ETHUSDT").unwrap()],
            ..RiskParameters::default()
        };
        let intent = TradeIntent::open(btc(), Side::Long, dec!(1000), dec!(5), 50, key());
        assert!(matches!(
            validate(&intent, None, &PendingAdjustment::default(), &p, &ctx(dec!(2000))),
            Err(RejectReason::UnsupportedMarket { .. })
        ));

        assert_eq!(
            validate(
                &intent,
                None,
                &PendingAdjustment::default(),
                &RiskParameters::default(),
                &ctx(Decimal::ZERO)
            ),
            Err(RejectReason::MarketPriceUnavailable)
        );
    }

    #[test]
    fn test_min_notional_and_position_count() {
        let p = RiskParameters {
            min_collateral: dec!(1),
            max_open_positions: 2,
            ..RiskParameters::default()
        };
        let small = TradeIntent::open(btc(), Side::Long, dec!(10), dec!(2), 50, key());
        assert!(matches!(
            validate(&small, None, &PendingAdjustment::default(), &p, &ctx(dec!(2000))),
            Err(RejectReason::BelowMinNotional { .. })
        ));

        let intent = TradeIntent::open(btc(), Side::Long, dec!(100), dec!(2), 50, key());
        let full = MarketContext {
            mark_price: Price::new(dec!(2000)),
            open_positions: 2,
        };
        assert_eq!(
            validate(&intent, None, &PendingAdjustment::default(), &p, &full),
            Err(RejectReason::TooManyPositions { open: 2, max: 2 })
        );
    }

    #[test]
    fn test_short_increase_fills_down() {
        let intent = TradeIntent::open(btc(), Side::Short, dec!(1000), dec!(5), 100, key());
        let order = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap();
        assert_eq!(order.acceptable_price, Price::new(dec!(1980)));
        assert_eq!(order.resulting.liquidation_price, Price::new(dec!(2400)));
    }

    #[test]
    fn test_unrepresentable_size_is_out_of_range() {
        let intent = TradeIntent::open(btc(), Side::Long, Decimal::MAX / dec!(2), dec!(5), 50, key());
        let err = validate(
            &intent,
            None,
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap_err();
        assert!(matches!(err, RejectReason::ValueOutOfRange { .. }));
        assert_eq!(err.as_str(), "value_out_of_range");

        // Collateral that overflows when added to the existing position
        let current = long_position(dec!(5000), dec!(1000), dec!(2000));
        let mut topup = TradeIntent::open(btc(), Side::Long, Decimal::MAX, dec!(1), 50, key());
        topup.leverage_target = None;
        topup.size_delta = dec!(1);
        let err = validate(
            &topup,
            Some(&current),
            &PendingAdjustment::default(),
            &RiskParameters::default(),
            &ctx(dec!(2000)),
        )
        .unwrap_err();
        assert!(matches!(err, RejectReason::ValueOutOfRange { .. }));
    }

    #[test]
    fn test_trigger_prices_follow_side() {
        let p = RiskParameters::default();
        let long = TradeIntent::open(btc(), Side::Long, dec!(1000), dec!(5), 50, key())
            .with_triggers(Some(Price::new(dec!(2500))), Some(Price::new(dec!(1800))));
        let order = validate(&long, None, &PendingAdjustment::default(), &p, &ctx(dec!(2000))).unwrap();
        assert_eq!(order.take_profit, Some(Price::new(dec!(2500))));
        assert_eq!(order.stop_loss, Some(Price::new(dec!(1800))));

        let backwards = TradeIntent::open(btc(), Side::Long, dec!(1000), dec!(5), 50, key())
            .with_triggers(Some(Price::new(dec!(1900))), None);
        assert!(matches!(
            validate(&backwards, None, &PendingAdjustment::default(), &p, &ctx(dec!(2000))),
            Err(RejectReason::InvalidTriggerPrice { .. })
        ));

        let short = TradeIntent::open(btc(), Side::Short, dec!(1000), dec!(5), 50, key())
            .with_triggers(Some(Price::new(dec!(1500))), Some(Price::new(dec!(1950))));
        assert!(matches!(
            validate(&short, None, &PendingAdjustment::default(), &p, &ctx(dec!(2000))),
            Err(RejectReason::InvalidTriggerPrice { .. })
        ));

        let current = long_position(dec!(5000), dec!(1000), dec!(2000));
        let close = TradeIntent::close(btc(), Side::Long, 50, key())
            .with_triggers(None, Some(Price::new(dec!(1500))));
        assert!(matches!(
            validate(&close, Some(&current), &PendingAdjustment::default(), &p, &ctx(dec!(2000))),
            Err(RejectReason::InvalidTriggerPrice { .. })
        ));
    }
}
