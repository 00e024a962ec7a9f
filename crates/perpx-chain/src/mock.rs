//! Scriptable in-process gateway.
//!
//! Used by unit and integration tests across the workspace. Submissions and
//! receipt outcomes follow queued scripts; every call is counted so tests can
//! assert that a code path never touched the chain.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, B256};
use alloy::sol_types::SolCall;
use parking_lot::Mutex;
use perpx_core::fee::DEFAULT_GAS_LIMIT;
use perpx_core::{FeeQuote, MarketId, Price};
use rust_decimal::Decimal;

use crate::erc20::{from_token_units, IERC20};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{BoxFuture, ChainGateway};
use crate::types::{MarketState, Receipt, ReceiptLookup, ReceiptStatus, SignedTx, TxPayload};

/// Gateway call kinds, for counters and injected latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    ChainId,
    Nonce,
    EstimateFee,
    Submit,
    Receipt,
    MarketState,
    Balance,
    Allowance,
}

const ALL_CALLS: [MockCall; 8] = [
    MockCall::ChainId,
    MockCall::Nonce,
    MockCall::EstimateFee,
    MockCall::Submit,
    MockCall::Receipt,
    MockCall::MarketState,
    MockCall::Balance,
    MockCall::Allowance,
];

impl MockCall {
    fn index(self) -> usize {
        match self {
            MockCall::ChainId => 0,
            MockCall::Nonce => 1,
            MockCall::EstimateFee => 2,
            MockCall::Submit => 3,
            MockCall::Receipt => 4,
            MockCall::MarketState => 5,
            MockCall::Balance => 6,
            MockCall::Allowance => 7,
        }
    }
}

/// Scripted response to one `submit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitBehavior {
    Accept,
    /// Times out and the transaction never reaches the node.
    Timeout,
    /// Times out but the transaction did reach the node.
    TimeoutButLanded,
    NonceTooLow,
    Underpriced,
    Reject(String),
}

/// How receipt polling behaves for one accepted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptPlan {
    /// `Pending` until the n-th poll, which returns a success receipt.
    ConfirmAfter(u32),
    /// `Pending` until the n-th poll, which returns a reverted receipt.
    RevertAfter(u32, String),
    /// Never mined: always `NotFound`.
    Never,
}

struct MockTx {
    signed: SignedTx,
    plan: ReceiptPlan,
    polls: u32,
}

struct MockState {
    chain_id: u64,
    nonces: HashMap<Address, u64>,
    markets: HashMap<MarketId, MarketState>,
    balance: Decimal,
    /// `None` is an unlimited approval.
    allowance: Option<Decimal>,
    gas_price: u64,
    priority_fee: u64,
    submit_script: VecDeque<SubmitBehavior>,
    receipt_plans: VecDeque<ReceiptPlan>,
    default_plan: ReceiptPlan,
    txs: HashMap<B256, MockTx>,
    submitted: Vec<SignedTx>,
    mined: HashMap<(Address, u64), B256>,
    height: u64,
    latency: HashMap<MockCall, Duration>,
    execution_price: Option<Price>,
}

/// Mock gateway for testing.
pub struct MockChainGateway {
    state: Mutex<MockState>,
    calls: [AtomicUsize; 8],
}

impl MockChainGateway {
    /// Create a mock reporting `chain_id`, accepting every submission and
    /// confirming on the first receipt poll.
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                chain_id,
                nonces: HashMap::new(),
                markets: HashMap::new(),
                balance: Decimal::ZERO,
                allowance: None,
                gas_price: 1_000_000,
                priority_fee: 100_000,
                submit_script: VecDeque::new(),
                receipt_plans: VecDeque::new(),
                default_plan: ReceiptPlan::ConfirmAfter(1),
                txs: HashMap::new(),
                submitted: Vec::new(),
                mined: HashMap::new(),
                height: 100,
                latency: HashMap::new(),
                execution_price: None,
            }),
            calls: Default::default(),
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.state.lock().nonces.insert(account, nonce);
    }

    pub fn set_market(&self, market: MarketId, price: Price, funding_rate: Decimal) {
        self.state
            .lock()
            .markets
            .insert(market, MarketState { price, funding_rate });
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().balance = balance;
    }

    /// Collateral the router may pull. Mined `approve` calls overwrite it.
    pub fn set_allowance(&self, allowance: Option<Decimal>) {
        self.state.lock().allowance = allowance;
    }

    pub fn set_gas_price(&self, gas_price: u64) {
        self.state.lock().gas_price = gas_price;
    }

    /// Fill price reported on success receipts.
    pub fn set_execution_price(&self, price: Option<Price>) {
        self.state.lock().execution_price = price;
    }

    /// Queue the outcome of the next `submit` call.
    pub fn push_submit(&self, behavior: SubmitBehavior) {
        self.state.lock().submit_script.push_back(behavior);
    }

    /// Queue the receipt plan for the next accepted transaction.
    pub fn push_receipt_plan(&self, plan: ReceiptPlan) {
        self.state.lock().receipt_plans.push_back(plan);
    }

    /// Plan used once the queue is empty.
    pub fn set_default_receipt_plan(&self, plan: ReceiptPlan) {
        self.state.lock().default_plan = plan;
    }

    pub fn set_latency(&self, call: MockCall, latency: Duration) {
        self.state.lock().latency.insert(call, latency);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self, call: MockCall) -> usize {
        self.calls[call.index()].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        ALL_CALLS.iter().map(|c| self.calls(*c)).sum()
    }

    /// Calls that prepare or perform a write: nonce, fee, submit.
    pub fn write_path_calls(&self) -> usize {
        self.calls(MockCall::Nonce) + self.calls(MockCall::EstimateFee) + self.calls(MockCall::Submit)
    }

    /// Every transaction the node accepted, in order.
    pub fn submitted(&self) -> Vec<SignedTx> {
        self.state.lock().submitted.clone()
    }

    /// Transaction mined at `(account, nonce)`, if any.
    pub fn mined_at(&self, account: Address, nonce: u64) -> Option<B256> {
        self.state.lock().mined.get(&(account, nonce)).copied()
    }

    pub fn allowance(&self) -> Option<Decimal> {
        self.state.lock().allowance
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn record(&self, call: MockCall) -> Duration {
        self.calls[call.index()].fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .latency
            .get(&call)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn accept(state: &mut MockState, tx: &SignedTx) {
        if state.txs.contains_key(&tx.tx_hash) {
            return;
        }
        let plan = state
            .receipt_plans
            .pop_front()
            .unwrap_or_else(|| state.default_plan.clone());
        state.txs.insert(
            tx.tx_hash,
            MockTx {
                signed: tx.clone(),
                plan,
                polls: 0,
            },
        );
        state.submitted.push(tx.clone());
    }

    fn do_submit(&self, tx: &SignedTx) -> GatewayResult<B256> {
        let mut state = self.state.lock();
        if state.mined.contains_key(&(tx.account, tx.nonce)) {
            return Err(GatewayError::NonceTooLow(format!("nonce {} already mined", tx.nonce)));
        }
        let behavior = state
            .submit_script
            .pop_front()
            .unwrap_or(SubmitBehavior::Accept);
        match behavior {
            SubmitBehavior::Accept => {
                Self::accept(&mut state, tx);
                Ok(tx.tx_hash)
            }
            SubmitBehavior::Timeout => Err(GatewayError::Timeout {
                call: "submit",
                timeout_ms: 0,
            }),
            SubmitBehavior::TimeoutButLanded => {
                Self::accept(&mut state, tx);
                Err(GatewayError::Timeout {
                    call: "submit",
                    timeout_ms: 0,
                })
            }
            SubmitBehavior::NonceTooLow => {
                let current = state.nonces.get(&tx.account).copied().unwrap_or_default();
                state.nonces.insert(tx.account, current.max(tx.nonce + 1));
                Err(GatewayError::NonceTooLow(format!("nonce {} too low", tx.nonce)))
            }
            SubmitBehavior::Underpriced => {
                Err(GatewayError::Underpriced("replacement transaction underpriced".into()))
            }
            SubmitBehavior::Reject(reason) => Err(GatewayError::Rejected(reason)),
        }
    }

    fn do_receipt(&self, tx_hash: B256) -> ReceiptLookup {
        let mut state = self.state.lock();
        let execution_price = state.execution_price;
        let Some(entry) = state.txs.get(&tx_hash) else {
            return ReceiptLookup::NotFound;
        };
        let key = (entry.signed.account, entry.signed.nonce);

        if let Some(winner) = state.mined.get(&key) {
            if *winner == tx_hash {
                let height = state.height;
                return ReceiptLookup::Found(Receipt {
                    tx_hash,
                    block_height: height,
                    status: ReceiptStatus::Success,
                    execution_price,
                });
            }
            return ReceiptLookup::NotFound;
        }

        let Some(entry) = state.txs.get_mut(&tx_hash) else {
            return ReceiptLookup::NotFound;
        };
        entry.polls += 1;
        let polls = entry.polls;
        let entry_raw = entry.signed.raw.clone();
        let outcome = match &entry.plan {
            ReceiptPlan::ConfirmAfter(n) if polls >= *n => Some(ReceiptStatus::Success),
            ReceiptPlan::RevertAfter(n, reason) if polls >= *n => Some(ReceiptStatus::Reverted {
                reason: reason.clone(),
            }),
            ReceiptPlan::Never => return ReceiptLookup::NotFound,
            _ => None,
        };

        match outcome {
            None => ReceiptLookup::Pending,
            Some(status) => {
                state.height += 1;
                let height = state.height;
                state.mined.insert(key, tx_hash);
                if status == ReceiptStatus::Success {
                    if let Some(amount) = approved_amount(&entry_raw) {
                        state.allowance = Some(amount);
                    }
                }
                let next = state.nonces.get(&key.0).copied().unwrap_or_default();
                state.nonces.insert(key.0, next.max(key.1 + 1));
                let execution_price = match status {
                    ReceiptStatus::Success => execution_price,
                    ReceiptStatus::Reverted { .. } => None,
                };
                ReceiptLookup::Found(Receipt {
                    tx_hash,
                    block_height: height,
                    status,
                    execution_price,
                })
            }
        }
    }
}

/// Amount of an ERC-20 `approve` carried by a raw type 2 transaction, at
/// six decimals.
fn approved_amount(raw: &[u8]) -> Option<Decimal> {
    let mut buf = raw;
    let TxEnvelope::Eip1559(signed) = TxEnvelope::decode_2718(&mut buf).ok()? else {
        return None;
    };
    let call = IERC20::approveCall::abi_decode(&signed.tx().input, true).ok()?;
    from_token_units(call.amount, 6).ok()
}

impl ChainGateway for MockChainGateway {
    fn chain_id(&self, _timeout: Duration) -> BoxFuture<'_, GatewayResult<u64>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::ChainId)).await;
            Ok(self.state.lock().chain_id)
        })
    }

    fn get_nonce(&self, account: Address, _timeout: Duration) -> BoxFuture<'_, GatewayResult<u64>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::Nonce)).await;
            Ok(self.state.lock().nonces.get(&account).copied().unwrap_or_default())
        })
    }

    fn estimate_fee<'a>(
        &'a self,
        _payload: &'a TxPayload,
        _timeout: Duration,
    ) -> BoxFuture<'a, GatewayResult<FeeQuote>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::EstimateFee)).await;
            let state = self.state.lock();
            Ok(FeeQuote::from_gas_price(
                state.gas_price,
                state.priority_fee,
                DEFAULT_GAS_LIMIT,
            ))
        })
    }

    fn submit<'a>(&'a self, tx: &'a SignedTx, _timeout: Duration) -> BoxFuture<'a, GatewayResult<B256>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::Submit)).await;
            self.do_submit(tx)
        })
    }

    fn get_receipt(
        &self,
        tx_hash: B256,
        _timeout: Duration,
    ) -> BoxFuture<'_, GatewayResult<ReceiptLookup>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::Receipt)).await;
            Ok(self.do_receipt(tx_hash))
        })
    }

    fn read_market_state<'a>(
        &'a self,
        market: &'a MarketId,
        _timeout: Duration,
    ) -> BoxFuture<'a, GatewayResult<MarketState>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::MarketState)).await;
            self.state
                .lock()
                .markets
                .get(market)
                .copied()
                .ok_or_else(|| GatewayError::Rejected(format!("unknown market {market}")))
        })
    }

    fn get_balance(&self, _account: Address, _timeout: Duration) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::Balance)).await;
            Ok(self.state.lock().balance)
        })
    }

    fn get_allowance(
        &self,
        _owner: Address,
        _spender: Address,
        _timeout: Duration,
    ) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(async move {
            tokio::time::sleep(self.record(MockCall::Allowance)).await;
            Ok(self.state.lock().allowance.unwrap_or(Decimal::MAX))
        })
    }
}
