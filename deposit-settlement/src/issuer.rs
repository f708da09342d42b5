// Copyright (c) 2024 Botho Foundation

//! Single-use deposit address generation.
//!
//! Each payment attempt gets a fresh Ed25519 keypair. The base58-encoded
//! verifying key is the deposit address; the 32-byte secret is handed back
//! to the caller, who must seal it with the [`KeyVault`](crate::vault::KeyVault)
//! immediately. Nothing is retained here.

use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{SettlementError, SettlementResult};

/// A freshly generated deposit address and its secret key.
pub struct IssuedAddress {
    /// Base58 public address
    pub address: String,
    /// Ed25519 secret key bytes, zeroed on drop
    pub secret: Zeroizing<[u8; SECRET_KEY_LENGTH]>,
}

/// Generates deposit keypairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressIssuer;

impl AddressIssuer {
    pub fn new() -> Self {
        Self
    }

    /// Generate a new keypair.
    pub fn issue(&self) -> IssuedAddress {
        let signing_key = SigningKey::generate(&mut OsRng);
        IssuedAddress {
            address: encode_address(&signing_key.verifying_key()),
            secret: Zeroizing::new(signing_key.to_bytes()),
        }
    }
}

/// Base58-encode a verifying key.
pub fn encode_address(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

/// Decode a base58 address into its 32 raw bytes.
pub fn decode_address(address: &str) -> SettlementResult<[u8; 32]> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| SettlementError::Validation(format!("invalid address {}: {}", address, e)))?;

    bytes.try_into().map_err(|b: Vec<u8>| {
        SettlementError::Validation(format!(
            "address {} decodes to {} bytes, expected 32",
            address,
            b.len()
        ))
    })
}

/// Rebuild a signing key from unsealed secret bytes.
pub fn signing_key_from_secret(secret: &[u8]) -> SettlementResult<SigningKey> {
    let bytes: &[u8; SECRET_KEY_LENGTH] = secret.try_into().map_err(|_| {
        SettlementError::Crypto(format!(
            "deposit secret must be {} bytes, got {}",
            SECRET_KEY_LENGTH,
            secret.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(bytes))
}
