//! Router calldata for normalized orders.
//!
//! Position-increasing orders call `increasePosition`, or
//! `increasePositionWithTriggers` when they carry a take-profit or
//! stop-loss; everything else calls `decreasePosition`. USD amounts are
//! fixed-point with [`USD_DECIMALS`], prices with [`PRICE_DECIMALS`]. A
//! trigger price of zero means no trigger. The keeper execution fee travels
//! as transaction value and is attached once the fee is known.
//!
//! Collateral approvals for the router are plain ERC-20 `approve` calls on
//! the collateral token.

use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use perpx_chain::{to_token_units, TxPayload, IERC20};
use perpx_core::{MarketId, NormalizedOrder, Price};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{ExecutionError, ExecutionResult};

/// Fixed-point decimals of USD amounts (size and collateral).
pub const USD_DECIMALS: u32 = 6;

/// Fixed-point decimals of prices.
pub const PRICE_DECIMALS: u32 = 10;

sol! {
    interface IPerpRouter {
        function increasePosition(
            bytes32 market,
            bool isLong,
            uint256 sizeDeltaUsd,
            uint256 collateralDelta,
            uint256 acceptablePrice
        ) external payable;

        function increasePositionWithTriggers(
            bytes32 market,
            bool isLong,
            uint256 sizeDeltaUsd,
            uint256 collateralDelta,
            uint256 acceptablePrice,
            uint256 takeProfitPrice,
            uint256 stopLossPrice
        ) external payable;

        function decreasePosition(
            bytes32 market,
            bool isLong,
            uint256 sizeDeltaUsd,
            uint256 collateralDelta,
            uint256 acceptablePrice,
            address receiver
        ) external payable;
    }
}

/// Builds transaction payloads for one account against one router.
#[derive(Debug, Clone, Copy)]
pub struct PayloadBuilder {
    router: Address,
    account: Address,
}

impl PayloadBuilder {
    pub fn new(router: Address, account: Address) -> Self {
        Self { router, account }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Calldata for `order`, with zero value.
    pub fn build(&self, order: &NormalizedOrder) -> ExecutionResult<TxPayload> {
        let market = market_word(&order.market)?;
        let is_long = order.side.is_long();
        let size = to_fixed(order.size_delta, USD_DECIMALS)?;
        let collateral = to_fixed(order.collateral_delta, USD_DECIMALS)?;
        let acceptable_price = price_word(order.acceptable_price)?;

        let triggered = order.take_profit.is_some() || order.stop_loss.is_some();
        let data = if order.kind.adds_exposure() && triggered {
            IPerpRouter::increasePositionWithTriggersCall {
                market,
                isLong: is_long,
                sizeDeltaUsd: size,
                collateralDelta: collateral,
                acceptablePrice: acceptable_price,
                takeProfitPrice: trigger_word(order.take_profit)?,
                stopLossPrice: trigger_word(order.stop_loss)?,
            }
            .abi_encode()
        } else if order.kind.adds_exposure() {
            IPerpRouter::increasePositionCall {
                market,
                isLong: is_long,
                sizeDeltaUsd: size,
                collateralDelta: collateral,
                acceptablePrice: acceptable_price,
            }
            .abi_encode()
        } else {
            IPerpRouter::decreasePositionCall {
                market,
                isLong: is_long,
                sizeDeltaUsd: size,
                collateralDelta: collateral,
                acceptablePrice: acceptable_price,
                receiver: self.account,
            }
            .abi_encode()
        };

        Ok(TxPayload {
            from: self.account,
            to: self.router,
            value: U256::ZERO,
            data: Bytes::from(data),
        })
    }

    /// ERC-20 `approve(router, amount)` on `token`, amount in token units.
    pub fn approve(&self, token: Address, amount: Decimal, decimals: u32) -> ExecutionResult<TxPayload> {
        let amount = to_token_units(amount, decimals).ok_or_else(|| {
            ExecutionError::InvalidIntent(format!("approval amount {amount} out of range"))
        })?;
        let data = IERC20::approveCall {
            spender: self.router,
            amount,
        }
        .abi_encode();
        Ok(TxPayload {
            from: self.account,
            to: token,
            value: U256::ZERO,
            data: Bytes::from(data),
        })
    }

    pub fn router(&self) -> Address {
        self.router
    }

    /// Zero-value self-transfer used to displace an in-flight nonce.
    pub fn cancel(&self) -> TxPayload {
        TxPayload {
            from: self.account,
            to: self.account,
            value: U256::ZERO,
            data: Bytes::new(),
        }
    }
}

/// Market id as a right-padded ASCII word.
fn market_word(market: &MarketId) -> ExecutionResult<FixedBytes<32>> {
    let bytes = market.as_str().as_bytes();
    if bytes.len() > 32 {
        return Err(ExecutionError::InvalidIntent(format!(
            "market id {market} longer than 32 bytes"
        )));
    }
    Ok(FixedBytes::<32>::right_padding_from(bytes))
}

fn price_word(price: Price) -> ExecutionResult<U256> {
    to_fixed(price.inner(), PRICE_DECIMALS)
}

fn trigger_word(price: Option<Price>) -> ExecutionResult<U256> {
    price.map_or(Ok(U256::ZERO), price_word)
}

/// Absolute value of `value` as an integer with `decimals` places,
/// truncating any finer precision.
fn to_fixed(value: Decimal, decimals: u32) -> ExecutionResult<U256> {
    let scale = Decimal::from(10u64.pow(decimals));
    value
        .abs()
        .checked_mul(scale)
        .and_then(|scaled| scaled.trunc().to_u128())
        .map(U256::from)
        .ok_or_else(|| ExecutionError::InvalidIntent(format!("amount {value} out of range")))
}
