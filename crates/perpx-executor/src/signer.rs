//! Transaction signing.
//!
//! Payload, nonce and fee become an EIP-1559 (type 2) transaction for the
//! configured chain id. Its signature hash is signed with the trading key
//! and the EIP-2718 encoding of the signed transaction is the raw bytes
//! handed to `eth_sendRawTransaction`.
//!
//! Signing is deterministic (RFC 6979), so re-signing the same inputs yields
//! the same transaction hash.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxKind};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer as AlloySigner;
use perpx_chain::{SignedTx, TxPayload};
use perpx_core::FeeQuote;
use thiserror::Error;
use zeroize::Zeroizing;

// =============================================================================
// KeySource and KeyManager
// =============================================================================

/// Source of the private key.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Load from environment variable (development).
    EnvVar { var_name: String },
    /// Load from file (production, recommend 0600 permissions).
    File { path: PathBuf },
}

/// Holds the trading key, if any.
///
/// Security notes:
/// - Keys are loaded once at startup; no runtime key rotation.
/// - Never log private key material.
pub struct KeyManager {
    trading_signer: Option<PrivateKeySigner>,
    trading_address: Option<Address>,
}

impl KeyManager {
    /// Load the trading key from `trading_source` and verify its address.
    ///
    /// With no source the manager is observation-only and every signing
    /// request fails with [`SignerError::NoTradingKey`].
    ///
    /// # Errors
    /// Returns `KeyError` if:
    /// - Environment variable not found
    /// - File read fails
    /// - Hex decoding fails
    /// - Private key is invalid
    /// - Address mismatch
    pub fn load(
        trading_source: Option<KeySource>,
        expected_trading_address: Option<Address>,
    ) -> Result<Self, KeyError> {
        let Some(source) = trading_source else {
            return Ok(Self::observation_only());
        };

        let secret_bytes: Zeroizing<Vec<u8>> = match source {
            KeySource::EnvVar { ref var_name } => {
                let hex = std::env::var(var_name)
                    .map_err(|_| KeyError::EnvVarNotFound(var_name.clone()))?;
                parse_hex_key(&hex)?
            }
            KeySource::File { ref path } => {
                let content = Zeroizing::new(std::fs::read_to_string(path)?);
                parse_hex_key(&content)?
            }
        };

        Self::from_bytes(&secret_bytes, expected_trading_address)
    }

    /// Load from raw key bytes.
    pub fn from_bytes(
        secret_bytes: &[u8],
        expected_address: Option<Address>,
    ) -> Result<Self, KeyError> {
        let signer = PrivateKeySigner::from_slice(secret_bytes)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        if let Some(expected) = expected_address {
            if signer.address() != expected {
                return Err(KeyError::AddressMismatch {
                    expected,
                    actual: signer.address(),
                });
            }
        }

        Ok(Self {
            trading_address: Some(signer.address()),
            trading_signer: Some(signer),
        })
    }

    /// A manager without a trading key.
    pub fn observation_only() -> Self {
        Self {
            trading_signer: None,
            trading_address: None,
        }
    }

    pub fn trading_signer(&self) -> Option<&PrivateKeySigner> {
        self.trading_signer.as_ref()
    }

    pub fn trading_address(&self) -> Option<Address> {
        self.trading_address
    }
}

// Supports 0x prefix and surrounding whitespace
fn parse_hex_key(hex_str: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let trimmed = hex_str.trim().trim_start_matches("0x");
    Ok(Zeroizing::new(hex::decode(trimmed)?))
}

/// Key management errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Failed to decode hex: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: Address, actual: Address },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Signer
// =============================================================================

/// Signing errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("No trading key available")]
    NoTradingKey,

    #[error("Signing failed: {0}")]
    SigningFailed(#[from] alloy::signers::Error),

    #[error("Fee field out of range: {0}")]
    InvalidFee(String),

    #[error("Payload sender {payload} is not the signing account {signer}")]
    SenderMismatch { payload: Address, signer: Address },
}

/// Signs transactions for one chain with the trading key.
pub struct TxSigner {
    key_manager: Arc<KeyManager>,
    chain_id: u64,
    usage: AtomicU64,
}

impl TxSigner {
    pub fn new(key_manager: Arc<KeyManager>, chain_id: u64) -> Self {
        Self {
            key_manager,
            chain_id,
            usage: AtomicU64::new(0),
        }
    }

    /// Sign `payload` at `nonce` with `fee`.
    ///
    /// The only side effect is the usage counter. The signature itself is
    /// never logged.
    ///
    /// # Errors
    /// `NoTradingKey` in observation-only mode, `SenderMismatch` when the
    /// payload was built for another account.
    pub async fn sign(
        &self,
        payload: &TxPayload,
        nonce: u64,
        fee: &FeeQuote,
    ) -> Result<SignedTx, SignerError> {
        let signer = self
            .key_manager
            .trading_signer()
            .ok_or(SignerError::NoTradingKey)?;
        if payload.from != signer.address() {
            return Err(SignerError::SenderMismatch {
                payload: payload.from,
                signer: signer.address(),
            });
        }

        if fee.priority_fee_per_gas > fee.max_fee_per_gas {
            return Err(SignerError::InvalidFee(format!(
                "priority fee {} above max fee {}",
                fee.priority_fee_per_gas, fee.max_fee_per_gas
            )));
        }

        let tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit: fee.gas_limit,
            max_fee_per_gas: u128::from(fee.max_fee_per_gas),
            max_priority_fee_per_gas: u128::from(fee.priority_fee_per_gas),
            to: TxKind::Call(payload.to),
            value: payload.value,
            access_list: Default::default(),
            input: payload.data.clone(),
        };
        // Includes the fee: a bumped replacement hashes differently.
        let payload_hash = tx.signature_hash();

        // NOTE: Do not log signature as it contains sensitive information
        let signature = signer.sign_hash(&payload_hash).await?;
        self.usage.fetch_add(1, Ordering::Relaxed);

        let signed = tx.into_signed(signature);
        let tx_hash = *signed.hash();
        let raw = TxEnvelope::from(signed).encoded_2718();

        Ok(SignedTx {
            account: payload.from,
            nonce,
            fee: *fee,
            payload_hash,
            tx_hash,
            raw: Bytes::from(raw),
        })
    }

    pub fn address(&self) -> Option<Address> {
        self.key_manager.trading_address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Signatures produced so far.
    pub fn usage_count(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::{keccak256, U256};
    use perpx_core::fee::DEFAULT_GAS_LIMIT;

    // Well-known test private key (DO NOT use in production)
    const TEST_PRIVATE_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_key_bytes() -> Vec<u8> {
        hex::decode(TEST_PRIVATE_KEY.trim_start_matches("0x")).unwrap()
    }

    fn test_signer() -> TxSigner {
        let manager = KeyManager::from_bytes(&test_key_bytes(), None).unwrap();
        TxSigner::new(Arc::new(manager), 42161)
    }

    fn payload(from: Address) -> TxPayload {
        TxPayload {
            from,
            to: Address::repeat_byte(0x33),
            value: U256::from(1_000u64),
            data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        }
    }

    fn fee() -> FeeQuote {
        FeeQuote::from_gas_price(1_000_000, 100_000, DEFAULT_GAS_LIMIT)
    }

    #[test]
    fn test_key_manager_from_bytes() {
        let manager = KeyManager::from_bytes(&test_key_bytes(), None).unwrap();
        assert!(manager.trading_signer().is_some());
        assert!(manager.trading_address().is_some());
    }

    #[test]
    fn test_key_manager_address_mismatch() {
        let result = KeyManager::from_bytes(&test_key_bytes(), Some(Address::ZERO));
        assert!(matches!(result, Err(KeyError::AddressMismatch { .. })));
    }

    #[test]
    fn test_key_manager_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trading.key");
        std::fs::write(&path, format!("  {TEST_PRIVATE_KEY}\n")).unwrap();

        let manager = KeyManager::load(Some(KeySource::File { path }), None).unwrap();
        let expected = KeyManager::from_bytes(&test_key_bytes(), None)
            .unwrap()
            .trading_address();
        assert_eq!(manager.trading_address(), expected);
    }

    #[test]
    fn test_key_manager_missing_env_var() {
        let result = KeyManager::load(
            Some(KeySource::EnvVar {
                var_name: "PERPX_TEST_KEY_THAT_DOES_NOT_EXIST".to_string(),
            }),
            None,
        );
        assert!(matches!(result, Err(KeyError::EnvVarNotFound(_))));
    }

    #[tokio::test]
    async fn test_sign_is_deterministic() {
        let signer = test_signer();
        let from = signer.address().unwrap();

        let a = signer.sign(&payload(from), 7, &fee()).await.unwrap();
        let b = signer.sign(&payload(from), 7, &fee()).await.unwrap();
        assert_eq!(a.tx_hash, b.tx_hash);
        assert_eq!(a.payload_hash, b.payload_hash);
        assert_eq!(a.nonce, 7);
        assert_eq!(a.account, from);
        assert_eq!(signer.usage_count(), 2);
    }

    #[tokio::test]
    async fn test_raw_is_a_recoverable_eip1559_transaction() {
        let signer = test_signer();
        let from = signer.address().unwrap();
        let signed = signer.sign(&payload(from), 3, &fee()).await.unwrap();

        assert_eq!(signed.raw[0], 0x02);
        assert_eq!(signed.tx_hash, keccak256(&signed.raw));

        let envelope = TxEnvelope::decode_2718(&mut signed.raw.as_ref()).unwrap();
        assert_eq!(*envelope.tx_hash(), signed.tx_hash);
        let TxEnvelope::Eip1559(decoded) = envelope else {
            panic!("expected a type 2 transaction");
        };
        let tx = decoded.tx();
        assert_eq!(tx.chain_id, 42161);
        assert_eq!(tx.nonce, 3);
        assert_eq!(tx.to, TxKind::Call(Address::repeat_byte(0x33)));
        assert_eq!(tx.value, U256::from(1_000u64));
        assert_eq!(tx.max_fee_per_gas, u128::from(fee().max_fee_per_gas));
        assert_eq!(tx.gas_limit, DEFAULT_GAS_LIMIT);
        assert_eq!(tx.signature_hash(), signed.payload_hash);

        let recovered = decoded
            .signature()
            .recover_address_from_prehash(&tx.signature_hash())
            .unwrap();
        assert_eq!(recovered, from);
    }

    #[tokio::test]
    async fn test_fee_and_nonce_change_the_hash() {
        let signer = test_signer();
        let from = signer.address().unwrap();

        let base = signer.sign(&payload(from), 7, &fee()).await.unwrap();
        let bumped = signer.sign(&payload(from), 7, &fee().bumped(1250)).await.unwrap();
        let next = signer.sign(&payload(from), 8, &fee()).await.unwrap();

        assert_ne!(base.payload_hash, bumped.payload_hash);
        assert_ne!(base.tx_hash, bumped.tx_hash);
        assert_ne!(base.tx_hash, next.tx_hash);
    }

    #[tokio::test]
    async fn test_signer_no_trading_key() {
        let signer = TxSigner::new(Arc::new(KeyManager::observation_only()), 1);
        let result = signer.sign(&payload(Address::ZERO), 0, &fee()).await;
        assert!(matches!(result, Err(SignerError::NoTradingKey)));
        assert_eq!(signer.usage_count(), 0);
    }

    #[tokio::test]
    async fn test_sender_must_match_key() {
        let signer = test_signer();
        let result = signer.sign(&payload(Address::repeat_byte(0x44)), 0, &fee()).await;
        assert!(matches!(result, Err(SignerError::SenderMismatch { .. })));
    }
}
