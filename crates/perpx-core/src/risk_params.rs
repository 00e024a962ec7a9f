//! Venue risk parameters.
//!
//! Loaded once at startup and shared read-only. `version` is carried into
//! every normalized order so a confirmed operation can be traced back to
//! the limits it was validated against.

use crate::error::{CoreError, Result};
use crate::types::MarketId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Risk parameters for one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Parameter set version. Default: 1.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Maximum resulting leverage. Default: 50.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Minimum resulting collateral in USD. Default: 25.
    #[serde(default = "default_min_collateral")]
    pub min_collateral: Decimal,
    /// Minimum distance between mark and liquidation price (bps). Default: 100.
    #[serde(default = "default_liquidation_buffer_bps")]
    pub liquidation_buffer_bps: u32,
    /// Minimum notional of a non-flat resulting position in USD. Default: 50.
    #[serde(default = "default_min_position_notional")]
    pub min_position_notional: Decimal,
    /// Maximum number of simultaneously open positions. Default: 10.
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Markets accepted for trading. Empty means every market.
    #[serde(default)]
    pub supported_markets: Vec<MarketId>,
    /// Per-market tightening or loosening of the global limits.
    #[serde(default)]
    pub overrides: BTreeMap<MarketId, MarketRiskOverride>,
}

fn default_version() -> u32 {
    1
}

fn default_max_leverage() -> Decimal {
    dec!(50)
}

fn default_min_collateral() -> Decimal {
    dec!(25)
}

fn default_liquidation_buffer_bps() -> u32 {
    100
}

fn default_min_position_notional() -> Decimal {
    dec!(50)
}

fn default_max_open_positions() -> usize {
    10
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            version: default_version(),
            max_leverage: default_max_leverage(),
            min_collateral: default_min_collateral(),
            liquidation_buffer_bps: default_liquidation_buffer_bps(),
            min_position_notional: default_min_position_notional(),
            max_open_positions: default_max_open_positions(),
            supported_markets: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }
}

/// Per-market override. Unset fields fall back to the global value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketRiskOverride {
    #[serde(default)]
    pub max_leverage: Option<Decimal>,
    #[serde(default)]
    pub min_collateral: Option<Decimal>,
    #[serde(default)]
    pub liquidation_buffer_bps: Option<u32>,
}

/// Limits in force for one market after overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveRisk {
    pub max_leverage: Decimal,
    pub min_collateral: Decimal,
    pub liquidation_buffer_bps: u32,
    pub min_position_notional: Decimal,
}

impl RiskParameters {
    /// Resolve the limits for `market`.
    pub fn for_market(&self, market: &MarketId) -> EffectiveRisk {
        let ov = self.overrides.get(market);
        EffectiveRisk {
            max_leverage: ov
                .and_then(|o| o.max_leverage)
                .unwrap_or(self.max_leverage),
            min_collateral: ov
                .and_then(|o| o.min_collateral)
                .unwrap_or(self.min_collateral),
            liquidation_buffer_bps: ov
                .and_then(|o| o.liquidation_buffer_bps)
                .unwrap_or(self.liquidation_buffer_bps),
            min_position_notional: self.min_position_notional,
        }
    }

    pub fn is_supported(&self, market: &MarketId) -> bool {
        self.supported_markets.is_empty() || self.supported_markets.contains(market)
    }

    /// Reject parameter sets that would make every check meaningless.
    pub fn validate(&self) -> Result<()> {
        let check = |lev: Decimal, min_col: Decimal, buffer: u32, scope: &str| -> Result<()> {
            if lev < Decimal::ONE {
                return Err(CoreError::InvalidConfig(format!(
                    "{scope}: max_leverage must be >= 1, got {lev}"
                )));
            }
            if min_col.is_sign_negative() {
                return Err(CoreError::InvalidConfig(format!(
                    "{scope}: min_collateral must be >= 0, got {min_col}"
                )));
            }
            if buffer >= 10_000 {
                return Err(CoreError::InvalidConfig(format!(
                    "{scope}: liquidation_buffer_bps must be < 10000, got {buffer}"
                )));
            }
            Ok(())
        };

        check(
            self.max_leverage,
            self.min_collateral,
            self.liquidation_buffer_bps,
            "risk",
        )?;
        if self.min_position_notional.is_sign_negative() {
            return Err(CoreError::InvalidConfig(
                "risk: min_position_notional must be >= 0".into(),
            ));
        }
        if self.max_open_positions == 0 {
            return Err(CoreError::InvalidConfig(
                "risk: max_open_positions must be > 0".into(),
            ));
        }
        for market in self.overrides.keys() {
            let eff = self.for_market(market);
            check(
                eff.max_leverage,
                eff.min_collateral,
                eff.liquidation_buffer_bps,
                market.as_str(),
            )?;
        }
        Ok(())
    }
}
