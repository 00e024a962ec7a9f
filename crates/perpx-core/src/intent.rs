//! Trade intents and boundary parsing.
//!
//! Inbound requests arrive as loosely-typed JSON. `TradeIntent::from_payload`
//! is the only place untyped data is accepted; everything past it works on
//! the strongly-typed intent.

use crate::decimal::Price;
use crate::error::{CoreError, Result};
use crate::types::{MarketId, PositionKey, Side};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Maximum accepted slippage (100%).
const MAX_SLIPPAGE_BPS: u32 = 10_000;

/// Maximum idempotency key length.
const MAX_KEY_LEN: usize = 128;

/// Largest USD amount accepted for size or collateral.
///
/// Keeps every product in the margin math (notional times leverage, size
/// times price) well inside `Decimal`'s 96-bit mantissa.
pub const MAX_USD_AMOUNT: Decimal = Decimal::from_parts(2_764_472_320, 232_830, 0, false, 0);

/// Largest leverage target accepted.
pub const MAX_LEVERAGE: Decimal = Decimal::from_parts(1_000, 0, 0, false, 0);

/// Caller-chosen key that makes intent submission idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidPayload("empty idempotency key".into()));
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(CoreError::InvalidPayload(format!(
                "idempotency key longer than {MAX_KEY_LEN} bytes"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to open, adjust or close a leveraged position.
///
/// `size_delta` is USD notional: positive grows the position, negative
/// shrinks it. `collateral_delta` follows the same sign convention for
/// posted margin. An open may leave `size_delta` at zero and give a
/// `leverage_target` instead; the validator then derives the size.
///
/// Immutable once created; the engine shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub market: MarketId,
    pub side: Side,
    pub size_delta: Decimal,
    pub collateral_delta: Decimal,
    pub leverage_target: Option<Decimal>,
    pub max_slippage_bps: u32,
    pub idempotency_key: IdempotencyKey,
    /// Explicit full close regardless of `size_delta`.
    #[serde(default)]
    pub close: bool,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
}

impl TradeIntent {
    /// Open (or increase) a position sized by leverage.
    pub fn open(
        market: MarketId,
        side: Side,
        collateral: Decimal,
        leverage: Decimal,
        max_slippage_bps: u32,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            market,
            side,
            size_delta: Decimal::ZERO,
            collateral_delta: collateral,
            leverage_target: Some(leverage),
            max_slippage_bps,
            idempotency_key,
            close: false,
            take_profit: None,
            stop_loss: None,
        }
    }

    /// Fully close the position at `(market, side)`.
    pub fn close(
        market: MarketId,
        side: Side,
        max_slippage_bps: u32,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            market,
            side,
            size_delta: Decimal::ZERO,
            collateral_delta: Decimal::ZERO,
            leverage_target: None,
            max_slippage_bps,
            idempotency_key,
            close: true,
            take_profit: None,
            stop_loss: None,
        }
    }

    /// Attach take-profit and stop-loss triggers to an open.
    #[must_use]
    pub fn with_triggers(mut self, take_profit: Option<Price>, stop_loss: Option<Price>) -> Self {
        self.take_profit = take_profit;
        self.stop_loss = stop_loss;
        self
    }

    pub fn position_key(&self) -> PositionKey {
        PositionKey::new(self.market.clone(), self.side)
    }

    /// Parse a loosely-typed inbound payload.
    ///
    /// Accepts the field aliases used by existing callers (`symbol`,
    /// `direction`, `size`, `collateral`/`margin`, `leverage`, `requestId`,
    /// `tp`/`tp1_price`, `sl`/`stop_loss`) and numbers given either as JSON
    /// numbers or strings. A trigger price of zero means no trigger.
    ///
    /// Amounts beyond `MAX_USD_AMOUNT` and leverage beyond `MAX_LEVERAGE`
    /// are refused here so that downstream margin math cannot overflow.
    pub fn from_payload(payload: &Value, default_slippage_bps: u32) -> Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| CoreError::InvalidPayload("payload must be a JSON object".into()))?;

        let market_raw = required_str(obj, &["marketId", "market", "symbol"])?;
        let market = MarketId::parse(market_raw)?;

        let side = Side::from_str(required_str(obj, &["side", "direction"])?)?;

        let size_delta = optional_decimal(obj, &["sizeDelta", "size"])?.unwrap_or_default();
        let collateral_delta = optional_decimal(obj, &["collateralDelta", "collateral", "margin"])?
            .unwrap_or_default();
        check_amount("sizeDelta", size_delta)?;
        check_amount("collateralDelta", collateral_delta)?;

        let leverage_target = optional_decimal(obj, &["leverageTarget", "leverage"])?;
        if let Some(lev) = leverage_target {
            if lev <= Decimal::ZERO {
                return Err(CoreError::InvalidPayload(format!(
                    "leverage must be positive, got {lev}"
                )));
            }
            if lev > MAX_LEVERAGE {
                return Err(CoreError::InvalidPayload(format!(
                    "leverage {lev} above {MAX_LEVERAGE}"
                )));
            }
        }

        let max_slippage_bps = match optional_decimal(obj, &["maxSlippageBps", "slippageBps"])? {
            None => default_slippage_bps,
            Some(bps) => {
                if bps.is_sign_negative() || bps.fract() != Decimal::ZERO {
                    return Err(CoreError::InvalidPayload(format!(
                        "slippage must be a non-negative integer bps value, got {bps}"
                    )));
                }
                bps.to_u32()
                    .filter(|v| *v <= MAX_SLIPPAGE_BPS)
                    .ok_or_else(|| {
                        CoreError::InvalidPayload(format!("slippage out of range: {bps}"))
                    })?
            }
        };

        let idempotency_key =
            IdempotencyKey::new(required_str(obj, &["idempotencyKey", "requestId"])?)?;

        let close = match lookup(obj, &["close"]) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(CoreError::InvalidPayload(format!(
                    "close must be a boolean, got {other}"
                )))
            }
        };

        let take_profit = trigger_price(obj, &["takeProfit", "tp", "tp1_price"])?;
        let stop_loss = trigger_price(obj, &["stopLoss", "sl", "stop_loss"])?;

        Ok(Self {
            market,
            side,
            size_delta,
            collateral_delta,
            leverage_target,
            max_slippage_bps,
            idempotency_key,
            close,
            take_profit,
            stop_loss,
        })
    }
}

fn check_amount(name: &str, value: Decimal) -> Result<()> {
    if value.abs() > MAX_USD_AMOUNT {
        return Err(CoreError::InvalidPayload(format!(
            "{name} {value} exceeds {MAX_USD_AMOUNT}"
        )));
    }
    Ok(())
}

fn trigger_price(obj: &Map<String, Value>, names: &[&str]) -> Result<Option<Price>> {
    match optional_decimal(obj, names)? {
        None => Ok(None),
        Some(p) if p.is_zero() => Ok(None),
        Some(p) if p.is_sign_negative() || p > MAX_USD_AMOUNT => Err(CoreError::InvalidPayload(
            format!("{} out of range: {p}", names[0]),
        )),
        Some(p) => Ok(Some(Price::new(p))),
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| obj.get(*name))
}

fn required_str<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Result<&'a str> {
    match lookup(obj, names) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(CoreError::InvalidPayload(format!(
            "{} must be a string, got {other}",
            names[0]
        ))),
        None => Err(CoreError::InvalidPayload(format!("missing {}", names[0]))),
    }
}

fn optional_decimal(obj: &Map<String, Value>, names: &[&str]) -> Result<Option<Decimal>> {
    let text = match lookup(obj, names) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(CoreError::InvalidPayload(format!(
                "{} must be numeric, got {other}",
                names[0]
            )))
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|_| CoreError::InvalidPayload(format!("{} is not a number: {text}", names[0])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_from_payload_canonical_fields() {
        let payload = json!({
            "marketId": "BTCUSDT",
            "side": "long",
            "sizeDelta": "5000",
            "collateralDelta": 1000,
            "leverageTarget": 5,
            "maxSlippageBps": 50,
            "idempotencyKey": "req-1"
        });

        let intent = TradeIntent::from_payload(&payload, 100).unwrap();
        assert_eq!(intent.market.as_str(), "BTCUSDT");
        assert_eq!(intent.side, Side::Long);
        assert_eq!(intent.size_delta, dec!(5000));
        assert_eq!(intent.collateral_delta, dec!(1000));
        assert_eq!(intent.leverage_target, Some(dec!(5)));
        assert_eq!(intent.max_slippage_bps, 50);
        assert_eq!(intent.idempotency_key.as_str(), "req-1");
        assert!(!intent.close);
    }

    #[test]
    fn test_from_payload_aliases_and_normalization() {
        let payload = json!({
            "symbol": "eth/usdt",
            "direction": "SHORT",
            "margin": "250.5",
            "leverage": "4",
            "requestId": "abc"
        });

        let intent = TradeIntent::from_payload(&payload, 75).unwrap();
        assert_eq!(intent.market.as_str(), "ETHUSDT");
        assert_eq!(intent.side, Side::Short);
        assert_eq!(intent.size_delta, Decimal::ZERO);
        assert_eq!(intent.collateral_delta, dec!(250.5));
        assert_eq!(intent.max_slippage_bps, 75);
    }

    #[test]
    fn test_from_payload_close_flag() {
        let payload = json!({
            "market": "BTCUSDT",
            "side": "long",
            "close": true,
            "idempotencyKey": "close-1"
        });

        let intent = TradeIntent::from_payload(&payload, 100).unwrap();
        assert!(intent.close);
    }

    #[test]
    fn test_from_payload_rejects_bad_input() {
        let cases = [
            json!("not an object"),
            json!({"side": "long", "idempotencyKey": "k"}),
            json!({"market": "BTC", "side": "sideways", "idempotencyKey": "k"}),
            json!({"market": "BTC", "side": "long"}),
            json!({"market": "BTC", "side": "long", "size": "abc", "idempotencyKey": "k"}),
            json!({"market": "BTC", "side": "long", "leverage": 0, "idempotencyKey": "k"}),
            json!({"market": "BTC", "side": "long", "slippageBps": 20000, "idempotencyKey": "k"}),
            json!({"market": "BTC", "side": "long", "close": "yes", "idempotencyKey": "k"}),
        ];

        for payload in cases {
            let result = TradeIntent::from_payload(&payload, 100);
            assert!(
                matches!(result, Err(CoreError::InvalidPayload(_) | CoreError::InvalidMarket(_))),
                "expected rejection for {payload}"
            );
        }
    }

    #[test]
    fn test_from_payload_bounds_amounts() {
        let oversized = [
            json!({"market": "ETH", "side": "long", "collateral": "5e28", "leverage": 10, "idempotencyKey": "k"}),
            json!({"market": "ETH", "side": "long", "size": "-2000000000000000", "idempotencyKey": "k"}),
            json!({"market": "ETH", "side": "long", "collateral": 100, "leverage": 1001, "idempotencyKey": "k"}),
            json!({"market": "ETH", "side": "long", "collateral": 100, "leverage": 5, "tp": -1, "idempotencyKey": "k"}),
        ];
        for payload in oversized {
            assert!(
                matches!(TradeIntent::from_payload(&payload, 100), Err(CoreError::InvalidPayload(_))),
                "expected rejection for {payload}"
            );
        }

        let at_limit = json!({
            "market": "ETH",
            "side": "long",
            "collateral": "1000000000000000",
            "leverage": 1000,
            "idempotencyKey": "k"
        });
        let intent = TradeIntent::from_payload(&at_limit, 100).unwrap();
        assert_eq!(intent.collateral_delta, MAX_USD_AMOUNT);
        assert_eq!(intent.leverage_target, Some(MAX_LEVERAGE));
    }

    #[test]
    fn test_from_payload_trigger_aliases() {
        let payload = json!({
            "market": "ETH",
            "side": "long",
            "collateral": 100,
            "leverage": 5,
            "tp1_price": "2500",
            "stop_loss": 0,
            "idempotencyKey": "k"
        });
        let intent = TradeIntent::from_payload(&payload, 100).unwrap();
        assert_eq!(intent.take_profit, Some(Price::new(dec!(2500))));
        assert_eq!(intent.stop_loss, None);

        let payload = json!({
            "market": "ETH",
            "side": "short",
            "collateral": 100,
            "leverage": 5,
            "takeProfit": 1500,
            "sl": "2100.5",
            "idempotencyKey": "k"
        });
        let intent = TradeIntent::from_payload(&payload, 100).unwrap();
        assert_eq!(intent.take_profit, Some(Price::new(dec!(1500))));
        assert_eq!(intent.stop_loss, Some(Price::new(dec!(2100.5))));
    }

    #[test]
    fn test_idempotency_key_trimmed() {
        let key = IdempotencyKey::new("  k-1 ").unwrap();
        assert_eq!(key.as_str(), "k-1");
        assert!(IdempotencyKey::new("   ").is_err());
    }
}
