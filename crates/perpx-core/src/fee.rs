//! Fee quotes and replacement bumping.

use serde::{Deserialize, Serialize};

/// Gas units the venue's keeper charges for executing a market order.
///
/// The execution fee is prepaid as transaction value:
/// `execution_fee = max_fee_per_gas * EXECUTION_FEE_GAS_UNITS`.
pub const EXECUTION_FEE_GAS_UNITS: u64 = 200_000;

/// Default gas limit for position calls.
pub const DEFAULT_GAS_LIMIT: u64 = 800_000;

/// Fee quote for one broadcast. All values in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub max_fee_per_gas: u64,
    pub priority_fee_per_gas: u64,
    pub gas_limit: u64,
    pub execution_fee: u64,
}

impl FeeQuote {
    /// Build a quote from the node's gas price.
    pub fn from_gas_price(gas_price: u64, priority_fee_per_gas: u64, gas_limit: u64) -> Self {
        Self {
            max_fee_per_gas: gas_price,
            priority_fee_per_gas: priority_fee_per_gas.min(gas_price),
            gas_limit,
            execution_fee: gas_price.saturating_mul(EXECUTION_FEE_GAS_UNITS),
        }
    }

    /// Quote for a replacement transaction.
    ///
    /// Both per-gas prices grow by at least `bump_bps` basis points (and by
    /// at least 1 wei) so nodes accept the replacement at the same nonce.
    #[must_use]
    pub fn bumped(&self, bump_bps: u32) -> Self {
        let bump = |value: u64| -> u64 {
            let scaled = (value as u128) * (10_000 + bump_bps as u128);
            let bumped = scaled.div_ceil(10_000);
            u64::try_from(bumped)
                .unwrap_or(u64::MAX)
                .max(value.saturating_add(1))
        };
        let max_fee_per_gas = bump(self.max_fee_per_gas);
        Self {
            max_fee_per_gas,
            priority_fee_per_gas: bump(self.priority_fee_per_gas).min(max_fee_per_gas),
            gas_limit: self.gas_limit,
            execution_fee: max_fee_per_gas.saturating_mul(EXECUTION_FEE_GAS_UNITS),
        }
    }

    /// Field-wise maximum of two quotes.
    #[must_use]
    pub fn max(&self, other: &FeeQuote) -> Self {
        let max_fee_per_gas = self.max_fee_per_gas.max(other.max_fee_per_gas);
        Self {
            max_fee_per_gas,
            priority_fee_per_gas: self
                .priority_fee_per_gas
                .max(other.priority_fee_per_gas)
                .min(max_fee_per_gas),
            gas_limit: self.gas_limit.max(other.gas_limit),
            execution_fee: self.execution_fee.max(other.execution_fee),
        }
    }

    /// Worst-case spend: gas at the fee cap plus the prepaid execution fee.
    pub fn max_cost(&self) -> u128 {
        (self.max_fee_per_gas as u128) * (self.gas_limit as u128) + self.execution_fee as u128
    }
}
