//! Application configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use alloy::primitives::Address;
use perpx_chain::{GatewayTimeouts, RpcConfig};
use perpx_core::{MarketId, RiskParameters};
use perpx_executor::{EngineConfig, ExecutionConfig, KeySource, TrackerConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Chain connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Venue price endpoint.
    #[serde(default = "default_price_url")]
    pub price_url: String,
    /// Chain id the node must report at startup. Default: 8453.
    #[serde(default = "default_expected_chain_id")]
    pub expected_chain_id: u64,
    /// Collateral token (USDC) contract.
    #[serde(default = "default_collateral_token")]
    pub collateral_token: String,
    /// Default: 6.
    #[serde(default = "default_collateral_decimals")]
    pub collateral_decimals: u32,
    /// Venue router receiving position calls.
    #[serde(default)]
    pub trading_contract: String,
    /// Timeout for read calls (ms). Default: 3000.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Timeout for broadcasts (ms). Default: 5000.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
}

fn default_rpc_url() -> String {
    "https://mainnet.base.org".to_string()
}

fn default_price_url() -> String {
    "http://127.0.0.1:8080/prices".to_string()
}

fn default_expected_chain_id() -> u64 {
    8453
}

fn default_collateral_token() -> String {
    "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string()
}

fn default_collateral_decimals() -> u32 {
    6
}

fn default_rpc_timeout_ms() -> u64 {
    3_000
}

fn default_submit_timeout_ms() -> u64 {
    5_000
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            price_url: default_price_url(),
            expected_chain_id: default_expected_chain_id(),
            collateral_token: default_collateral_token(),
            collateral_decimals: default_collateral_decimals(),
            trading_contract: String::new(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
        }
    }
}

/// Where the trading key comes from.
///
/// At most one of `key_env` and `key_file` may be set. With neither, the
/// bot runs observation-only against `observation_address`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Environment variable holding the hex private key.
    #[serde(default)]
    pub key_env: Option<String>,
    /// File holding the hex private key (0600 recommended).
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Address the loaded key must derive to.
    #[serde(default)]
    pub expected_address: Option<String>,
    /// Account to track when no key is configured.
    #[serde(default)]
    pub observation_address: Option<String>,
}

/// Operation log location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("data/operations.jsonl")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
        }
    }
}

/// Markets accepted for trading. Empty accepts every market.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketsConfig {
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Background monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Liquidation scan interval (ms). Default: 10,000.
    #[serde(default = "default_liquidation_scan_interval_ms")]
    pub liquidation_scan_interval_ms: u64,
    /// Collateral balance below which preflight warns (USD). Default: 100.
    #[serde(default = "default_low_balance_warning")]
    pub low_balance_warning: Decimal,
}

fn default_liquidation_scan_interval_ms() -> u64 {
    10_000
}

fn default_low_balance_warning() -> Decimal {
    Decimal::ONE_HUNDRED
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            liquidation_scan_interval_ms: default_liquidation_scan_interval_ms(),
            low_balance_warning: default_low_balance_warning(),
        }
    }
}

/// Top-level configuration, one TOML table per section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub risk: RiskParameters,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub markets: MarketsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML content.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values before anything is wired.
    pub fn validate(&self) -> AppResult<()> {
        if self.chain.rpc_url.trim().is_empty() {
            return Err(AppError::Config("chain.rpc_url must be set".into()));
        }
        self.router()?;
        parse_address("chain.collateral_token", &self.chain.collateral_token)?;
        if self.chain.rpc_timeout_ms == 0 || self.chain.submit_timeout_ms == 0 {
            return Err(AppError::Config("chain timeouts must be positive".into()));
        }

        if self.signer.key_env.is_some() && self.signer.key_file.is_some() {
            return Err(AppError::Config(
                "signer.key_env and signer.key_file are mutually exclusive".into(),
            ));
        }
        self.expected_address()?;
        if self.key_source().is_none() {
            match &self.signer.observation_address {
                Some(raw) => {
                    parse_address("signer.observation_address", raw)?;
                }
                None => {
                    return Err(AppError::Config(
                        "no trading key configured; set signer.observation_address".into(),
                    ))
                }
            }
        }

        self.risk_parameters()?
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;

        if self.execution.fee_bump_bps == 0 {
            return Err(AppError::Config(
                "execution.fee_bump_bps must be positive so replacements outbid".into(),
            ));
        }
        if self.execution.submit_attempts == 0 {
            return Err(AppError::Config("execution.submit_attempts must be >= 1".into()));
        }
        if self.execution.gas_limit == 0 {
            return Err(AppError::Config("execution.gas_limit must be positive".into()));
        }

        let tracker = &self.tracker;
        if tracker.base_interval_ms == 0 || tracker.base_interval_ms > tracker.max_interval_ms {
            return Err(AppError::Config(format!(
                "tracker intervals invalid: base {} max {}",
                tracker.base_interval_ms, tracker.max_interval_ms
            )));
        }
        if tracker.horizon_ms < tracker.max_interval_ms {
            return Err(AppError::Config(format!(
                "tracker.horizon_ms ({}) must cover at least one max interval ({})",
                tracker.horizon_ms, tracker.max_interval_ms
            )));
        }

        if self.monitor.liquidation_scan_interval_ms == 0 {
            return Err(AppError::Config(
                "monitor.liquidation_scan_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn router(&self) -> AppResult<Address> {
        parse_address("chain.trading_contract", &self.chain.trading_contract)
    }

    pub fn key_source(&self) -> Option<KeySource> {
        if let Some(var_name) = &self.signer.key_env {
            return Some(KeySource::EnvVar {
                var_name: var_name.clone(),
            });
        }
        self.signer
            .key_file
            .as_ref()
            .map(|path| KeySource::File { path: path.clone() })
    }

    pub fn expected_address(&self) -> AppResult<Option<Address>> {
        self.signer
            .expected_address
            .as_deref()
            .map(|raw| parse_address("signer.expected_address", raw))
            .transpose()
    }

    pub fn observation_address(&self) -> AppResult<Option<Address>> {
        self.signer
            .observation_address
            .as_deref()
            .map(|raw| parse_address("signer.observation_address", raw))
            .transpose()
    }

    /// Risk parameters with `[markets]` folded into the supported list.
    pub fn risk_parameters(&self) -> AppResult<RiskParameters> {
        let mut params = self.risk.clone();
        for symbol in &self.markets.symbols {
            let market = MarketId::parse(symbol)
                .map_err(|e| AppError::Config(format!("markets.symbols: {e}")))?;
            if !params.supported_markets.contains(&market) {
                params.supported_markets.push(market);
            }
        }
        Ok(params)
    }

    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            rpc_url: self.chain.rpc_url.clone(),
            price_url: self.chain.price_url.clone(),
            collateral_token: self.chain.collateral_token.clone(),
            collateral_decimals: self.chain.collateral_decimals,
            gas_limit: self.execution.gas_limit,
        }
    }

    pub fn timeouts(&self) -> GatewayTimeouts {
        GatewayTimeouts {
            read_ms: self.chain.rpc_timeout_ms,
            submit_ms: self.chain.submit_timeout_ms,
        }
    }

    /// The engine's immutable slice of the configuration.
    pub fn engine_config(&self, account: Address) -> AppResult<EngineConfig> {
        Ok(EngineConfig {
            account,
            router: self.router()?,
            execution: self.execution.clone(),
            tracker: self.tracker,
            collateral_token: Some(parse_address(
                "chain.collateral_token",
                &self.chain.collateral_token,
            )?),
            collateral_decimals: self.chain.collateral_decimals,
        })
    }
}

fn parse_address(field: &str, raw: &str) -> AppResult<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| AppError::Config(format!("{field}: invalid address {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINIMAL: &str = r#"
        [chain]
        trading_contract = "0x1111111111111111111111111111111111111111"

        [signer]
        observation_address = "0x2222222222222222222222222222222222222222"
    "#;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.chain.expected_chain_id, 8453);
        assert_eq!(config.risk.max_leverage, dec!(50));
        assert_eq!(config.risk.min_collateral, dec!(25));
        assert_eq!(config.risk.liquidation_buffer_bps, 100);
        assert_eq!(config.execution.max_retries, 2);
        assert_eq!(config.execution.fee_bump_bps, 1250);
        assert_eq!(config.execution.gas_limit, 800_000);
        assert_eq!(config.monitor.liquidation_scan_interval_ms, 10_000);
        assert!(config.key_source().is_none());
    }

    #[test]
    fn test_engine_config_carries_collateral_token() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        let engine = config.engine_config(Address::repeat_byte(0x22)).unwrap();
        assert_eq!(
            engine.collateral_token,
            Some(Address::from_str(&default_collateral_token()).unwrap())
        );
        assert_eq!(engine.collateral_decimals, 6);
        assert_eq!(engine.execution.persist_attempts, 5);
        assert_eq!(engine.execution.approval_multiplier, dec!(2));
    }

    #[test]
    fn test_markets_fold_into_supported() {
        let content = format!(
            "{MINIMAL}\n[markets]\nsymbols = [\"btc/usdt\", \"ETHUSDT\"]\n"
        );
        let config = AppConfig::from_toml_str(&content).unwrap();
        let params = config.risk_parameters().unwrap();
        assert_eq!(params.supported_markets.len(), 2);
        assert!(params.is_supported(&MarketId::parse("BTCUSDT").unwrap()));
    }

    #[test]
    fn test_missing_router_rejected() {
        let content = r#"
            [signer]
            observation_address = "0x2222222222222222222222222222222222222222"
        "#;
        let err = AppConfig::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("trading_contract"));
    }

    #[test]
    fn test_conflicting_key_sources_rejected() {
        let content = format!(
            "{MINIMAL}\nkey_env = \"PERPX_KEY\"\nkey_file = \"/tmp/key\"\n"
        );
        // The extra keys land in [signer], the last table of MINIMAL.
        assert!(AppConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_invalid_tracker_rejected() {
        let content = format!(
            "{MINIMAL}\n[tracker]\nbase_interval_ms = 9000\nmax_interval_ms = 8000\n"
        );
        assert!(AppConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_zero_fee_bump_rejected() {
        let content = format!("{MINIMAL}\n[execution]\nfee_bump_bps = 0\n");
        assert!(AppConfig::from_toml_str(&content).is_err());
    }
}
