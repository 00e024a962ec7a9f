//! Timeout-enforcing gateway client with submission dedupe.
//!
//! `submit` is not idempotent at the network layer: broadcasting the same
//! signed transaction twice may surface as an error from the node or, worse,
//! be counted twice by callers. The client keys every broadcast by
//! `(account, nonce, payload_hash)`:
//! - A key whose broadcast was acknowledged answers `AlreadyInFlight`
//!   without touching the network.
//! - A key whose broadcast timed out is uncertain and may be rebroadcast.
//! - A key whose broadcast was refused is forgotten.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use perpx_core::{FeeQuote, MarketId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{with_timeout, ChainGateway};
use crate::types::{MarketState, ReceiptLookup, SignedTx, SubmissionKey, TxPayload};

/// Per-call timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayTimeouts {
    /// Reads: nonce, fee, receipt, market state, balance, allowance.
    /// Default: 3000ms.
    #[serde(default = "default_read_timeout_ms")]
    pub read_ms: u64,
    /// Broadcasts. Default: 5000ms.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
    3_000
}

fn default_submit_timeout_ms() -> u64 {
    5_000
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            read_ms: default_read_timeout_ms(),
            submit_ms: default_submit_timeout_ms(),
        }
    }
}

impl GatewayTimeouts {
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn submit(&self) -> Duration {
        Duration::from_millis(self.submit_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BroadcastState {
    /// Node acknowledged the broadcast.
    Accepted,
    /// Broadcast timed out; the node may or may not have it.
    Uncertain,
}

#[derive(Debug, Clone, Copy)]
struct BroadcastEntry {
    tx_hash: B256,
    state: BroadcastState,
}

/// Gateway wrapper used by the engine and tracker.
#[derive(Clone)]
pub struct ChainClient {
    gateway: Arc<dyn ChainGateway>,
    timeouts: GatewayTimeouts,
    broadcasts: Arc<DashMap<SubmissionKey, BroadcastEntry>>,
}

impl ChainClient {
    pub fn new(gateway: Arc<dyn ChainGateway>, timeouts: GatewayTimeouts) -> Self {
        Self {
            gateway,
            timeouts,
            broadcasts: Arc::new(DashMap::new()),
        }
    }

    pub fn timeouts(&self) -> GatewayTimeouts {
        self.timeouts
    }

    pub async fn chain_id(&self) -> GatewayResult<u64> {
        let t = self.timeouts.read();
        with_timeout("chain_id", t, self.gateway.chain_id(t)).await
    }

    pub async fn get_nonce(&self, account: Address) -> GatewayResult<u64> {
        let t = self.timeouts.read();
        with_timeout("get_nonce", t, self.gateway.get_nonce(account, t)).await
    }

    pub async fn estimate_fee(&self, payload: &TxPayload) -> GatewayResult<FeeQuote> {
        let t = self.timeouts.read();
        with_timeout("estimate_fee", t, self.gateway.estimate_fee(payload, t)).await
    }

    pub async fn get_receipt(&self, tx_hash: B256) -> GatewayResult<ReceiptLookup> {
        let t = self.timeouts.read();
        with_timeout("get_receipt", t, self.gateway.get_receipt(tx_hash, t)).await
    }

    pub async fn read_market_state(&self, market: &MarketId) -> GatewayResult<MarketState> {
        let t = self.timeouts.read();
        with_timeout("read_market_state", t, self.gateway.read_market_state(market, t)).await
    }

    pub async fn get_balance(&self, account: Address) -> GatewayResult<Decimal> {
        let t = self.timeouts.read();
        with_timeout("get_balance", t, self.gateway.get_balance(account, t)).await
    }

    pub async fn get_allowance(&self, owner: Address, spender: Address) -> GatewayResult<Decimal> {
        let t = self.timeouts.read();
        with_timeout("get_allowance", t, self.gateway.get_allowance(owner, spender, t)).await
    }

    /// Broadcast `tx` unless the same payload at the same nonce is already
    /// known to be in flight.
    pub async fn submit(&self, tx: &SignedTx) -> GatewayResult<B256> {
        let key = tx.submission_key();

        if let Some(entry) = self.broadcasts.get(&key) {
            if entry.state == BroadcastState::Accepted {
                debug!(tx_hash = %entry.tx_hash, nonce = tx.nonce, "Duplicate broadcast suppressed");
                return Err(GatewayError::AlreadyInFlight {
                    tx_hash: entry.tx_hash,
                });
            }
        }
        self.broadcasts.insert(
            key,
            BroadcastEntry {
                tx_hash: tx.tx_hash,
                state: BroadcastState::Uncertain,
            },
        );

        let t = self.timeouts.submit();
        match with_timeout("submit", t, self.gateway.submit(tx, t)).await {
            Ok(hash) => {
                if hash != tx.tx_hash {
                    warn!(expected = %tx.tx_hash, returned = %hash, "Node returned unexpected tx hash");
                }
                self.broadcasts.insert(
                    key,
                    BroadcastEntry {
                        tx_hash: hash,
                        state: BroadcastState::Accepted,
                    },
                );
                Ok(hash)
            }
            Err(e) if e.is_timeout() => Err(e),
            Err(e) => {
                self.broadcasts.remove(&key);
                Err(e)
            }
        }
    }

    /// Drop dedupe entries for a nonce that reached a terminal state.
    pub fn forget_nonce(&self, account: Address, nonce: u64) {
        self.broadcasts
            .retain(|key, _| !(key.account == account && key.nonce == nonce));
    }

    /// Number of broadcasts currently remembered.
    pub fn tracked_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockChainGateway, SubmitBehavior};
    use alloy::primitives::{keccak256, Bytes};
    use perpx_core::fee::DEFAULT_GAS_LIMIT;

    fn signed(nonce: u64, tag: u8) -> SignedTx {
        let raw = Bytes::from(vec![tag, nonce as u8]);
        SignedTx {
            account: Address::repeat_byte(0x11),
            nonce,
            fee: FeeQuote::from_gas_price(1_000, 100, DEFAULT_GAS_LIMIT),
            payload_hash: keccak256([tag]),
            tx_hash: keccak256(&raw),
            raw,
        }
    }

    fn client(mock: &Arc<MockChainGateway>) -> ChainClient {
        ChainClient::new(
            mock.clone(),
            GatewayTimeouts {
                read_ms: 50,
                submit_ms: 50,
            },
        )
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_in_flight() {
        let mock = Arc::new(MockChainGateway::new(8453));
        let client = client(&mock);
        let tx = signed(0, 1);

        let hash = client.submit(&tx).await.unwrap();
        assert_eq!(hash, tx.tx_hash);

        let second = client.submit(&tx).await;
        assert_eq!(second, Err(GatewayError::AlreadyInFlight { tx_hash: hash }));
        assert_eq!(mock.calls(MockCall::Submit), 1);
    }

    #[tokio::test]
    async fn test_replacement_with_new_payload_is_not_deduped() {
        let mock = Arc::new(MockChainGateway::new(8453));
        let client = client(&mock);

        client.submit(&signed(0, 1)).await.unwrap();
        client.submit(&signed(0, 2)).await.unwrap();
        assert_eq!(mock.calls(MockCall::Submit), 2);
    }

    #[tokio::test]
    async fn test_timed_out_broadcast_may_be_retried() {
        let mock = Arc::new(MockChainGateway::new(8453));
        mock.push_submit(SubmitBehavior::Timeout);
        let client = client(&mock);
        let tx = signed(3, 1);

        let first = client.submit(&tx).await;
        assert!(matches!(first, Err(GatewayError::Timeout { call: "submit", .. })));

        let retry = client.submit(&tx).await;
        assert_eq!(retry, Ok(tx.tx_hash));
        assert_eq!(mock.calls(MockCall::Submit), 2);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_is_forgotten() {
        let mock = Arc::new(MockChainGateway::new(8453));
        mock.push_submit(SubmitBehavior::Underpriced);
        let client = client(&mock);
        let tx = signed(1, 1);

        assert!(matches!(
            client.submit(&tx).await,
            Err(GatewayError::Underpriced(_))
        ));
        assert_eq!(client.tracked_broadcasts(), 0);
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let mock = Arc::new(MockChainGateway::new(8453));
        mock.set_latency(MockCall::Nonce, Duration::from_millis(500));
        let client = client(&mock);

        let result = client.get_nonce(Address::repeat_byte(0x11)).await;
        assert!(matches!(
            result,
            Err(GatewayError::Timeout {
                call: "get_nonce",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_forget_nonce() {
        let mock = Arc::new(MockChainGateway::new(8453));
        let client = client(&mock);

        client.submit(&signed(4, 1)).await.unwrap();
        client.submit(&signed(5, 1)).await.unwrap();
        client.forget_nonce(Address::repeat_byte(0x11), 4);
        assert_eq!(client.tracked_broadcasts(), 1);
    }
}
