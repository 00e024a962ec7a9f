//! Transaction and ledger types exchanged with the gateway.

use alloy::primitives::{Address, Bytes, B256, U256};
use perpx_core::{FeeQuote, Price};
use rust_decimal::Decimal;

/// Unsigned call: who calls what with which value and calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl TxPayload {
    #[must_use]
    pub fn with_value(&self, value: U256) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }
}

/// Signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub account: Address,
    pub nonce: u64,
    pub fee: FeeQuote,
    /// Hash of the signed-over envelope (payload, nonce, fee, chain id).
    pub payload_hash: B256,
    /// Hash of the raw bytes; the ledger's transaction identifier.
    pub tx_hash: B256,
    pub raw: Bytes,
}

impl SignedTx {
    pub fn submission_key(&self) -> SubmissionKey {
        SubmissionKey {
            account: self.account,
            nonce: self.nonce,
            payload_hash: self.payload_hash,
        }
    }
}

/// Dedupe key for broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionKey {
    pub account: Address,
    pub nonce: u64,
    pub payload_hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted { reason: String },
}

/// Ledger-confirmed outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_height: u64,
    pub status: ReceiptStatus,
    /// Fill price reported by the venue, when the receipt carries one.
    pub execution_price: Option<Price>,
}

/// Result of a receipt query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptLookup {
    Found(Receipt),
    /// Known to the node, not yet mined.
    Pending,
    /// Unknown to the node. May be propagation delay or a drop.
    NotFound,
}

/// Market snapshot read from the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketState {
    pub price: Price,
    pub funding_rate: Decimal,
}
