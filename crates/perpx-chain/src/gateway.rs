//! Chain gateway trait.
//!
//! Trait-based abstraction over the ledger so the engine can run against
//! the JSON-RPC node in production and a scripted gateway in tests.

use std::pin::Pin;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use perpx_core::{FeeQuote, MarketId};
use rust_decimal::Decimal;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{MarketState, ReceiptLookup, SignedTx, TxPayload};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Read/write access to the ledger.
///
/// Every method receives the caller's timeout. Implementations should pass
/// it to their transport; [`crate::ChainClient`] additionally enforces it
/// around the whole call and reports `GatewayError::Timeout`.
pub trait ChainGateway: Send + Sync {
    fn chain_id(&self, timeout: Duration) -> BoxFuture<'_, GatewayResult<u64>>;

    /// Next usable nonce for `account`, counting pending transactions.
    fn get_nonce(&self, account: Address, timeout: Duration) -> BoxFuture<'_, GatewayResult<u64>>;

    fn estimate_fee<'a>(
        &'a self,
        payload: &'a TxPayload,
        timeout: Duration,
    ) -> BoxFuture<'a, GatewayResult<FeeQuote>>;

    /// Broadcast a signed transaction. Not idempotent at the network layer.
    fn submit<'a>(&'a self, tx: &'a SignedTx, timeout: Duration) -> BoxFuture<'a, GatewayResult<B256>>;

    fn get_receipt(&self, tx_hash: B256, timeout: Duration)
        -> BoxFuture<'_, GatewayResult<ReceiptLookup>>;

    fn read_market_state<'a>(
        &'a self,
        market: &'a MarketId,
        timeout: Duration,
    ) -> BoxFuture<'a, GatewayResult<MarketState>>;

    /// Collateral token balance of `account`, in token units.
    fn get_balance(&self, account: Address, timeout: Duration)
        -> BoxFuture<'_, GatewayResult<Decimal>>;

    /// Collateral `spender` may pull from `owner`, in token units.
    fn get_allowance(
        &self,
        owner: Address,
        spender: Address,
        timeout: Duration,
    ) -> BoxFuture<'_, GatewayResult<Decimal>>;
}

/// Run `fut` under `timeout`, mapping expiry to `GatewayError::Timeout`.
pub async fn with_timeout<T, F>(call: &'static str, timeout: Duration, fut: F) -> GatewayResult<T>
where
    F: std::future::Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            call,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
