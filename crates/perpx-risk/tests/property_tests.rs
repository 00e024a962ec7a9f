//! Property-based tests for the risk validator.
//!
//! Whatever the intent and starting position, an accepted order never
//! leaves a position above max leverage or below min collateral.

use perpx_core::{
    IdempotencyKey, MarketId, PendingAdjustment, Position, PositionDelta, Price, RiskParameters,
    Side, TradeIntent,
};
use perpx_risk::{validate, MarketContext};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $1 to $100,000
}

fn usd_strategy() -> impl Strategy<Value = Decimal> {
    (-50_000i64..=50_000i64).prop_map(|x| Decimal::new(x, 1)) // -$5,000 to $5,000
}

fn leverage_strategy() -> impl Strategy<Value = Option<Decimal>> {
    prop::option::of((1u32..=100u32).prop_map(Decimal::from))
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Long), Just(Side::Short)]
}

fn market() -> MarketId {
    MarketId::parse("ETHUSDT").unwrap()
}

fn existing(side: Side, size_usd: Decimal, collateral: Decimal, entry: Decimal) -> Option<Position> {
    if size_usd <= Decimal::ZERO || collateral <= Decimal::ZERO {
        return None;
    }
    Position::settle(
        None,
        &PositionDelta {
            market: market(),
            side,
            size_delta: size_usd,
            collateral_delta: collateral,
            price: Price::new(entry),
            close: false,
        },
        1,
    )
    .ok()
}

proptest! {
    /// Accepted orders respect max leverage and min collateral
    #[test]
    fn accepted_orders_respect_limits(
        side in side_strategy(),
        current_size in usd_strategy(),
        current_collateral in usd_strategy(),
        entry in price_strategy(),
        mark in price_strategy(),
        size_delta in usd_strategy(),
        collateral_delta in usd_strategy(),
        leverage_target in leverage_strategy(),
        max_leverage in (1u32..=50u32).prop_map(Decimal::from),
        min_collateral in (0i64..=500i64).prop_map(Decimal::from),
        close in any::<bool>(),
    ) {
        let params = RiskParameters {
            max_leverage,
            min_collateral,
            min_position_notional: Decimal::ZERO,
            ..RiskParameters::default()
        };
        let current = existing(side, current_size, current_collateral, entry);
        let intent = TradeIntent {
            market: market(),
            side,
            size_delta,
            collateral_delta,
            leverage_target,
            max_slippage_bps: 50,
            idempotency_key: IdempotencyKey::new("prop").unwrap(),
            close,
            take_profit: None,
            stop_loss: None,
        };
        let ctx = MarketContext {
            mark_price: Price::new(mark),
            open_positions: 0,
        };

        if let Ok(order) = validate(&intent, current.as_ref(), &PendingAdjustment::default(), &params, &ctx) {
            if !order.resulting.is_flat() {
                prop_assert!(
                    order.resulting.leverage <= max_leverage,
                    "leverage {} above max {}", order.resulting.leverage, max_leverage
                );
                prop_assert!(
                    order.resulting.collateral >= min_collateral,
                    "collateral {} below min {}", order.resulting.collateral, min_collateral
                );
            }
        }
    }

    /// Rejections never depend on anything but the inputs
    #[test]
    fn validation_is_deterministic(
        side in side_strategy(),
        mark in price_strategy(),
        collateral in (1i64..=5_000i64).prop_map(Decimal::from),
        leverage in (1u32..=100u32).prop_map(Decimal::from),
    ) {
        let params = RiskParameters::default();
        let intent = TradeIntent::open(
            market(),
            side,
            collateral,
            leverage,
            50,
            IdempotencyKey::new("prop").unwrap(),
        );
        let ctx = MarketContext {
            mark_price: Price::new(mark),
            open_positions: 0,
        };
        let first = validate(&intent, None, &PendingAdjustment::default(), &params, &ctx);
        let second = validate(&intent, None, &PendingAdjustment::default(), &params, &ctx);
        prop_assert_eq!(first, second);
    }
}
