// Copyright (c) 2024 Botho Foundation

//! Encryption at rest for deposit private keys.
//!
//! Sealed blobs are laid out as `nonce (12 bytes) || ciphertext || tag (16
//! bytes)` and encrypted with ChaCha20-Poly1305 under a single 32-byte vault
//! key. Every call to [`KeyVault::encrypt`] draws a fresh random nonce.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::{
    config::Environment,
    error::{SettlementError, SettlementResult},
};

/// Vault key length in bytes.
pub const VAULT_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric vault for ephemeral deposit keys.
pub struct KeyVault {
    key: Zeroizing<[u8; VAULT_KEY_LEN]>,
}

impl KeyVault {
    /// Create a vault from raw key bytes.
    pub fn new(key: [u8; VAULT_KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Create a vault from a 64-character hex key.
    pub fn from_hex(key_hex: &str) -> SettlementResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(key_hex.trim())
                .map_err(|e| SettlementError::Config(format!("vault key is not valid hex: {}", e)))?,
        );
        if bytes.len() != VAULT_KEY_LEN {
            return Err(SettlementError::Config(format!(
                "vault key must be {} bytes, got {}",
                VAULT_KEY_LEN,
                bytes.len()
            )));
        }

        let mut key = [0u8; VAULT_KEY_LEN];
        key.copy_from_slice(&bytes);
        let vault = Self::new(key);
        zeroize::Zeroize::zeroize(&mut key);
        Ok(vault)
    }

    /// Create a vault with a process-random key.
    ///
    /// Anything sealed with it is unrecoverable after the process exits.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; VAULT_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let vault = Self::new(key);
        zeroize::Zeroize::zeroize(&mut key);
        vault
    }

    /// Build the vault from configuration.
    ///
    /// A missing key is fatal in production. Elsewhere a throwaway key is
    /// generated and a warning logged.
    pub fn from_config(key_hex: Option<&str>, environment: Environment) -> SettlementResult<Self> {
        match key_hex {
            Some(key) => Self::from_hex(key),
            None if environment == Environment::Production => Err(SettlementError::Config(
                "vault_key is required in production".to_string(),
            )),
            None => {
                tracing::warn!(
                    "No vault key configured; using a throwaway key. Deposit keys sealed by this \
                     process cannot be recovered after restart."
                );
                Ok(Self::ephemeral())
            }
        }
    }

    /// Generate a new random vault key, hex encoded.
    pub fn generate_key_hex() -> String {
        let mut key = Zeroizing::new([0u8; VAULT_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        hex::encode(&key[..])
    }

    /// Seal a secret.
    pub fn encrypt(&self, secret: &[u8]) -> SettlementResult<Vec<u8>> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret)
            .map_err(|_| SettlementError::Crypto("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a sealed blob.
    ///
    /// Fails on truncated input or authentication failure; no plaintext is
    /// returned in either case.
    pub fn decrypt(&self, blob: &[u8]) -> SettlementResult<Zeroizing<Vec<u8>>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(SettlementError::Crypto(format!(
                "sealed key truncated ({} bytes)",
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SettlementError::Crypto("authentication tag mismatch".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }

    fn cipher(&self) -> SettlementResult<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|_| SettlementError::Crypto("failed to create cipher".to_string()))
    }
}
