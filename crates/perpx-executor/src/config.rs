//! Engine and tracker configuration.

use alloy::primitives::Address;
use perpx_core::fee::DEFAULT_GAS_LIMIT;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Submission and replacement policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Replacement broadcasts allowed per operation before it fails with
    /// `RetriesExhausted`. Default: 2.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fee increase per replacement in basis points. Default: 1250 (12.5%).
    #[serde(default = "default_fee_bump_bps")]
    pub fee_bump_bps: u32,

    /// Attempts per gateway call that timed out. Default: 3.
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,

    /// Base delay between those attempts in milliseconds. Default: 200.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Gas limit for position calls. Default: 800000.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Slippage applied when an inbound intent omits one. Default: 100.
    #[serde(default = "default_slippage_bps")]
    pub default_slippage_bps: u32,

    /// Maximum age of a cached mark price in milliseconds. Default: 1000.
    #[serde(default = "default_market_cache_ms")]
    pub market_cache_ms: u64,

    /// Attempts to journal a snapshot once its transaction is on the
    /// network. Default: 5.
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,

    /// Collateral approved per approval, as a multiple of the collateral
    /// the order posts. Default: 2.
    #[serde(default = "default_approval_multiplier")]
    pub approval_multiplier: Decimal,
}

fn default_max_retries() -> u32 {
    2
}

fn default_fee_bump_bps() -> u32 {
    1250
}

fn default_submit_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_slippage_bps() -> u32 {
    100
}

fn default_market_cache_ms() -> u64 {
    1_000
}

fn default_persist_attempts() -> u32 {
    5
}

fn default_approval_multiplier() -> Decimal {
    Decimal::TWO
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            fee_bump_bps: default_fee_bump_bps(),
            submit_attempts: default_submit_attempts(),
            retry_base_ms: default_retry_base_ms(),
            gas_limit: default_gas_limit(),
            default_slippage_bps: default_slippage_bps(),
            market_cache_ms: default_market_cache_ms(),
            persist_attempts: default_persist_attempts(),
            approval_multiplier: default_approval_multiplier(),
        }
    }
}

/// Receipt polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// First poll delay in milliseconds. Default: 500.
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// Poll delay ceiling in milliseconds. Default: 8000.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Random jitter added to each delay in milliseconds. Default: 250.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// A transaction with no receipt after this long is dropped.
    /// Default: 120000.
    #[serde(default = "default_horizon_ms")]
    pub horizon_ms: u64,
}

fn default_base_interval_ms() -> u64 {
    500
}

fn default_max_interval_ms() -> u64 {
    8_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_horizon_ms() -> u64 {
    120_000
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            jitter_ms: default_jitter_ms(),
            horizon_ms: default_horizon_ms(),
        }
    }
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Signing account.
    pub account: Address,
    /// Venue router receiving position calls.
    pub router: Address,
    pub execution: ExecutionConfig,
    pub tracker: TrackerConfig,
    /// Collateral token the router pulls margin from. Without one no
    /// allowance is checked before increases.
    pub collateral_token: Option<Address>,
    pub collateral_decimals: u32,
}
