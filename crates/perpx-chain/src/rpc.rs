//! JSON-RPC gateway.
//!
//! Talks to an EVM node over HTTP for nonce, fee, broadcast and receipt
//! calls, reads collateral balance and router allowance with ERC-20 calls and
//! reads mark price and funding from the venue's price endpoint.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolCall;
use perpx_core::fee::DEFAULT_GAS_LIMIT;
use perpx_core::{FeeQuote, MarketId, Price};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::erc20::{from_token_units, IERC20};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{BoxFuture, ChainGateway};
use crate::types::{MarketState, Receipt, ReceiptLookup, ReceiptStatus, SignedTx, TxPayload};

/// Connection settings for [`RpcChainGateway`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub rpc_url: String,
    /// Venue price endpoint; queried as `GET {price_url}?market=BTCUSDT`.
    pub price_url: String,
    /// Collateral token contract (USDC), 0x-prefixed hex.
    pub collateral_token: String,
    /// Collateral token decimals. Default: 6.
    #[serde(default = "default_collateral_decimals")]
    pub collateral_decimals: u32,
    /// Upper bound on gas for position calls. Default: 800,000.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

fn default_collateral_decimals() -> u32 {
    6
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Gateway backed by a JSON-RPC node.
pub struct RpcChainGateway {
    client: Client,
    config: RpcConfig,
    collateral_token: Address,
    next_id: AtomicU64,
}

impl RpcChainGateway {
    pub fn new(config: RpcConfig) -> GatewayResult<Self> {
        let collateral_token = Address::from_str(&config.collateral_token).map_err(|e| {
            GatewayError::Decode(format!(
                "invalid collateral token address {}: {e}",
                config.collateral_token
            ))
        })?;
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            collateral_token,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(
        &self,
        call: &'static str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        trace!(id, method, "JSON-RPC request");

        let response = self
            .client
            .post(&self.config.rpc_url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest(call, timeout, e))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| map_reqwest(call, timeout, e))?;

        if let Some(err) = parsed.error {
            return Err(classify_rpc_error(err.code, &err.message));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn fetch_fee(&self, payload: &TxPayload, timeout: Duration) -> GatewayResult<FeeQuote> {
        let gas_price = parse_hex_u64(
            &self.call("estimate_fee", "eth_gasPrice", json!([]), timeout).await?,
        )?;

        // Not every node implements the priority fee method.
        let priority = match self
            .call("estimate_fee", "eth_maxPriorityFeePerGas", json!([]), timeout)
            .await
        {
            Ok(v) => parse_hex_u64(&v)?,
            Err(e) if e.is_timeout() => return Err(e),
            Err(e) => {
                debug!(error = %e, "eth_maxPriorityFeePerGas unavailable, using 0");
                0
            }
        };

        let tx = json!({
            "from": format!("{:#x}", payload.from),
            "to": format!("{:#x}", payload.to),
            "value": format!("{:#x}", payload.value),
            "data": format!("0x{}", hex::encode(&payload.data)),
        });
        let gas_limit = match self
            .call("estimate_fee", "eth_estimateGas", json!([tx]), timeout)
            .await
        {
            Ok(v) => {
                let estimate = parse_hex_u64(&v)?;
                (estimate.saturating_mul(12) / 10).clamp(21_000, self.config.gas_limit)
            }
            Err(e) if e.is_timeout() => return Err(e),
            Err(e) => {
                debug!(error = %e, "eth_estimateGas failed, using configured gas limit");
                self.config.gas_limit
            }
        };

        Ok(FeeQuote::from_gas_price(gas_price, priority, gas_limit))
    }

    async fn fetch_receipt(&self, tx_hash: B256, timeout: Duration) -> GatewayResult<ReceiptLookup> {
        let hash = format!("{tx_hash:#x}");
        let receipt = self
            .call("get_receipt", "eth_getTransactionReceipt", json!([hash]), timeout)
            .await?;

        if receipt.is_null() {
            let tx = self
                .call("get_receipt", "eth_getTransactionByHash", json!([hash]), timeout)
                .await?;
            return Ok(if tx.is_null() {
                ReceiptLookup::NotFound
            } else {
                ReceiptLookup::Pending
            });
        }

        let block_height = parse_hex_u64(receipt.get("blockNumber").unwrap_or(&Value::Null))?;
        let status = match receipt.get("status").and_then(Value::as_str) {
            Some("0x1") => ReceiptStatus::Success,
            Some(other) => ReceiptStatus::Reverted {
                reason: format!("receipt status {other}"),
            },
            None => return Err(GatewayError::Decode("receipt without status".into())),
        };

        Ok(ReceiptLookup::Found(Receipt {
            tx_hash,
            block_height,
            status,
            execution_price: None,
        }))
    }

    async fn fetch_market(&self, market: &MarketId, timeout: Duration) -> GatewayResult<MarketState> {
        let response = self
            .client
            .get(&self.config.price_url)
            .query(&[("market", market.as_str())])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest("read_market_state", timeout, e))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "price endpoint: HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| map_reqwest("read_market_state", timeout, e))?;

        let price = decimal_field(&body, &["price", "markPrice"])?
            .ok_or_else(|| GatewayError::Decode(format!("no price for {market}")))?;
        let funding_rate = decimal_field(&body, &["fundingRate", "funding"])?.unwrap_or_default();

        Ok(MarketState {
            price: Price::new(price),
            funding_rate,
        })
    }

    async fn fetch_balance(&self, account: Address, timeout: Duration) -> GatewayResult<Decimal> {
        let data = IERC20::balanceOfCall { account }.abi_encode();
        let call = json!({
            "to": format!("{:#x}", self.collateral_token),
            "data": format!("0x{}", hex::encode(data)),
        });
        let result = self
            .call("get_balance", "eth_call", json!([call, "latest"]), timeout)
            .await?;

        let bytes = parse_hex_bytes(&result)?;
        let raw = IERC20::balanceOfCall::abi_decode_returns(&bytes, true)
            .map_err(|e| GatewayError::Decode(format!("balanceOf: {e}")))?
            ._0;

        from_token_units(raw, self.config.collateral_decimals)
    }

    async fn fetch_allowance(
        &self,
        owner: Address,
        spender: Address,
        timeout: Duration,
    ) -> GatewayResult<Decimal> {
        let data = IERC20::allowanceCall { owner, spender }.abi_encode();
        let call = json!({
            "to": format!("{:#x}", self.collateral_token),
            "data": format!("0x{}", hex::encode(data)),
        });
        let result = self
            .call("get_allowance", "eth_call", json!([call, "latest"]), timeout)
            .await?;

        let bytes = parse_hex_bytes(&result)?;
        let raw = IERC20::allowanceCall::abi_decode_returns(&bytes, true)
            .map_err(|e| GatewayError::Decode(format!("allowance: {e}")))?
            ._0;

        // Unlimited approvals exceed Decimal's range.
        Ok(from_token_units(raw, self.config.collateral_decimals).unwrap_or(Decimal::MAX))
    }
}

impl ChainGateway for RpcChainGateway {
    fn chain_id(&self, timeout: Duration) -> BoxFuture<'_, GatewayResult<u64>> {
        Box::pin(async move {
            parse_hex_u64(&self.call("chain_id", "eth_chainId", json!([]), timeout).await?)
        })
    }

    fn get_nonce(&self, account: Address, timeout: Duration) -> BoxFuture<'_, GatewayResult<u64>> {
        Box::pin(async move {
            let params = json!([format!("{account:#x}"), "pending"]);
            parse_hex_u64(
                &self
                    .call("get_nonce", "eth_getTransactionCount", params, timeout)
                    .await?,
            )
        })
    }

    fn estimate_fee<'a>(
        &'a self,
        payload: &'a TxPayload,
        timeout: Duration,
    ) -> BoxFuture<'a, GatewayResult<FeeQuote>> {
        Box::pin(self.fetch_fee(payload, timeout))
    }

    fn submit<'a>(&'a self, tx: &'a SignedTx, timeout: Duration) -> BoxFuture<'a, GatewayResult<B256>> {
        Box::pin(async move {
            let raw = format!("0x{}", hex::encode(&tx.raw));
            match self
                .call("submit", "eth_sendRawTransaction", json!([raw]), timeout)
                .await
            {
                Ok(v) => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| GatewayError::Decode(format!("tx hash not a string: {v}")))?;
                    B256::from_str(s).map_err(|e| GatewayError::Decode(format!("tx hash: {e}")))
                }
                // Node already holds this exact transaction.
                Err(GatewayError::Rejected(msg)) if msg.to_ascii_lowercase().contains("already known") => {
                    Ok(tx.tx_hash)
                }
                Err(e) => Err(e),
            }
        })
    }

    fn get_receipt(&self, tx_hash: B256, timeout: Duration) -> BoxFuture<'_, GatewayResult<ReceiptLookup>> {
        Box::pin(self.fetch_receipt(tx_hash, timeout))
    }

    fn read_market_state<'a>(
        &'a self,
        market: &'a MarketId,
        timeout: Duration,
    ) -> BoxFuture<'a, GatewayResult<MarketState>> {
        Box::pin(self.fetch_market(market, timeout))
    }

    fn get_balance(&self, account: Address, timeout: Duration) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(self.fetch_balance(account, timeout))
    }

    fn get_allowance(
        &self,
        owner: Address,
        spender: Address,
        timeout: Duration,
    ) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(self.fetch_allowance(owner, spender, timeout))
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

fn map_reqwest(call: &'static str, timeout: Duration, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout {
            call,
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if e.is_decode() {
        GatewayError::Decode(e.to_string())
    } else {
        GatewayError::Transport(e.to_string())
    }
}

/// Map a node error message onto the outcomes the engine branches on.
fn classify_rpc_error(code: i64, message: &str) -> GatewayError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("nonce too low") || lower.contains("nonce has already been used") {
        GatewayError::NonceTooLow(message.to_string())
    } else if lower.contains("underpriced")
        || lower.contains("fee too low")
        || lower.contains("max fee per gas less than block base fee")
    {
        GatewayError::Underpriced(message.to_string())
    } else {
        GatewayError::Rejected(format!("{message} (code {code})"))
    }
}

fn parse_hex_u64(value: &Value) -> GatewayResult<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| GatewayError::Decode(format!("expected hex quantity, got {value}")))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| GatewayError::Decode(format!("bad hex quantity {s}: {e}")))
}

fn parse_hex_bytes(value: &Value) -> GatewayResult<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| GatewayError::Decode(format!("expected hex data, got {value}")))?;
    hex::decode(s.trim_start_matches("0x")).map_err(|e| GatewayError::Decode(e.to_string()))
}

fn decimal_field(body: &Value, names: &[&str]) -> GatewayResult<Option<Decimal>> {
    let Some(v) = names.iter().find_map(|n| body.get(*n)) else {
        return Ok(None);
    };
    let text = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Null => return Ok(None),
        other => return Err(GatewayError::Decode(format!("non-numeric field: {other}"))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|e| GatewayError::Decode(format!("{text}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_classify_rpc_error() {
        assert!(matches!(
            classify_rpc_error(-32000, "nonce too low: next nonce 5, tx nonce 4"),
            GatewayError::NonceTooLow(_)
        ));
        assert!(matches!(
            classify_rpc_error(-32000, "replacement transaction underpriced"),
            GatewayError::Underpriced(_)
        ));
        assert!(matches!(
            classify_rpc_error(3, "execution reverted: slippage"),
            GatewayError::Rejected(_)
        ));
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64(&json!("0x2105")).unwrap(), 8453);
        assert!(parse_hex_u64(&json!(12)).is_err());
        assert!(parse_hex_u64(&json!("0xzz")).is_err());
    }

    #[test]
    fn test_decimal_field_accepts_numbers_and_strings() {
        let body = json!({"price": "64000.5", "fundingRate": 0.0001});
        assert_eq!(decimal_field(&body, &["price"]).unwrap(), Some(dec!(64000.5)));
        assert_eq!(decimal_field(&body, &["fundingRate"]).unwrap(), Some(dec!(0.0001)));
        assert_eq!(decimal_field(&body, &["missing"]).unwrap(), None);
    }
}
