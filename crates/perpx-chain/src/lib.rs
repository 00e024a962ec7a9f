//! Chain access for the perpx engine.
//!
//! Every ledger read and write goes through the [`ChainGateway`] trait:
//! - [`RpcChainGateway`]: JSON-RPC over HTTP plus a price endpoint
//! - [`MockChainGateway`]: scriptable in-process gateway for tests
//! - [`ChainClient`]: per-call timeouts and the submission dedupe map,
//!   wrapping whichever gateway is injected
//! - [`MarketStateCache`]: last-read mark price per market

pub mod cache;
pub mod client;
pub mod erc20;
pub mod error;
pub mod gateway;
pub mod mock;
pub mod rpc;
pub mod types;

pub use cache::MarketStateCache;
pub use client::{ChainClient, GatewayTimeouts};
pub use erc20::{from_token_units, to_token_units, IERC20};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{BoxFuture, ChainGateway};
pub use mock::{MockCall, MockChainGateway, ReceiptPlan, SubmitBehavior};
pub use rpc::{RpcChainGateway, RpcConfig};
pub use types::{
    MarketState, Receipt, ReceiptLookup, ReceiptStatus, SignedTx, SubmissionKey, TxPayload,
};
