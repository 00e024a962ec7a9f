//! ERC-20 bindings for the collateral token.

use std::str::FromStr;

use alloy::primitives::U256;
use alloy::sol;
use rust_decimal::Decimal;

use crate::error::{GatewayError, GatewayResult};

sol! {
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// Token units to a decimal amount.
pub fn from_token_units(raw: U256, decimals: u32) -> GatewayResult<Decimal> {
    let whole = Decimal::from_str(&raw.to_string())
        .map_err(|e| GatewayError::Decode(format!("amount {raw} out of range: {e}")))?;
    let scale = Decimal::from(10u64.pow(decimals.min(19)));
    Ok(whole / scale)
}

/// Decimal amount to token units, truncating below the token's precision.
///
/// `None` for negative amounts.
pub fn to_token_units(amount: Decimal, decimals: u32) -> Option<U256> {
    if amount.is_sign_negative() {
        return None;
    }
    let scaled = amount.checked_mul(Decimal::from(10u64.pow(decimals.min(19))))?;
    U256::from_str(&scaled.trunc().to_string()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use alloy::sol_types::SolCall;
    use rust_decimal_macros::dec;

    #[test]
    fn test_token_unit_conversion() {
        let raw = U256::from(1_234_567_890u64);
        assert_eq!(from_token_units(raw, 6).unwrap(), dec!(1234.56789));
        assert_eq!(to_token_units(dec!(1234.5678901), 6), Some(raw));
        assert_eq!(to_token_units(dec!(-1), 6), None);
    }

    #[test]
    fn test_calldata_selectors() {
        let balance = IERC20::balanceOfCall {
            account: Address::ZERO,
        }
        .abi_encode();
        // keccak256("balanceOf(address)")[..4]
        assert_eq!(&balance[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(balance.len(), 36);

        let approve = IERC20::approveCall {
            spender: Address::ZERO,
            amount: U256::from(1u64),
        }
        .abi_encode();
        // keccak256("approve(address,uint256)")[..4]
        assert_eq!(&approve[..4], &[0x09, 0x5e, 0xa7, 0xb3]);

        let decoded = IERC20::approveCall::abi_decode(&approve, true).unwrap();
        assert_eq!(decoded.amount, U256::from(1u64));
    }
}
