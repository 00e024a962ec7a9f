//! Position addressing types.

use crate::error::{CoreError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Normalized market identifier (e.g. `BTCUSDT`).
///
/// Separators are stripped and letters upper-cased, so `"btc/usdt"`,
/// `"BTC-USDT"` and `"BTCUSDT"` all address the same market.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketId(String);

impl MarketId {
    /// Parse and normalize a raw market symbol.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !matches!(c, '/' | '-' | '_' | ':') && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.is_empty() {
            return Err(CoreError::InvalidMarket(format!("empty symbol: {raw:?}")));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidMarket(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MarketId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<MarketId> for String {
    fn from(market: MarketId) -> Self {
        market.0
    }
}

impl FromStr for MarketId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// PnL sign: +1 for long, -1 for short.
    #[inline]
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    #[inline]
    pub fn is_long(&self) -> bool {
        matches!(self, Side::Long)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = CoreError;

    /// Accepts `long`/`buy` and `short`/`sell`, case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(CoreError::InvalidPayload(format!("unknown side: {other}"))),
        }
    }
}

/// Position Book slot: one position per (market, side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub market: MarketId,
    pub side: Side,
}

impl PositionKey {
    pub fn new(market: MarketId, side: Side) -> Self {
        Self { market, side }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.market, self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_id_normalization() {
        assert_eq!(MarketId::parse("BTC/USDT").unwrap().as_str(), "BTCUSDT");
        assert_eq!(MarketId::parse(" eth-usd ").unwrap().as_str(), "ETHUSD");
        assert_eq!(MarketId::parse("sol_usdc").unwrap().as_str(), "SOLUSDC");
    }

    #[test]
    fn test_market_id_rejects_garbage() {
        assert!(MarketId::parse("").is_err());
        assert!(MarketId::parse("//").is_err());
        assert!(MarketId::parse("BTC$USD").is_err());
    }

    #[test]
    fn test_market_id_deserialize_normalizes() {
        let market: MarketId = serde_json::from_str(r#""btc/usdt""#).unwrap();
        assert_eq!(market.as_str(), "BTCUSDT");
        assert!(serde_json::from_str::<MarketId>("\"\"").is_err());
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("LONG".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("Sell".parse::<Side>().unwrap(), Side::Short);
        assert!("flat".parse::<Side>().is_err());
    }

    #[test]
    fn test_side_serde_lowercase() {
        let json = serde_json::to_string(&Side::Short).unwrap();
        assert_eq!(json, r#""short""#);
    }

    #[test]
    fn test_position_key_display() {
        let key = PositionKey::new(MarketId::parse("btc/usdt").unwrap(), Side::Long);
        assert_eq!(key.to_string(), "BTCUSDT:long");
    }
}
