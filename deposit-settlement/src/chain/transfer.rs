// Copyright (c) 2024 Botho Foundation

//! Native transfer encoding.
//!
//! A sweep is a single system-program transfer signed by the deposit key.
//! The wire form is a legacy message:
//!
//! ```text
//! signatures:   compact-u16 count, 64-byte Ed25519 signatures
//! header:       required sigs, readonly signed, readonly unsigned
//! account keys: compact-u16 count, 32-byte keys [from, to, system program]
//! blockhash:    32 bytes
//! instructions: compact-u16 count, then per instruction
//!               program index, compact-u16 account indexes, compact-u16 data
//! ```

use ed25519_dalek::{Signer, SigningKey};

use crate::{
    error::{SettlementError, SettlementResult},
    issuer::decode_address,
};

/// Fee reserved from the swept balance, in base units.
pub const TRANSFER_FEE: u64 = 5_000;

/// System program id (all zero bytes).
const SYSTEM_PROGRAM_ID: [u8; 32] = [0u8; 32];

/// System program instruction index for `Transfer`.
const SYSTEM_TRANSFER: u32 = 2;

/// A signed transfer ready for submission.
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    /// Serialized transaction
    pub wire: Vec<u8>,
    /// Base58 transaction signature
    pub signature: String,
}

/// Build and sign a transfer of `amount` from the key's address to `to`.
pub fn build_transfer(
    from: &SigningKey,
    to: &str,
    amount: u64,
    recent_blockhash: &str,
) -> SettlementResult<SignedTransfer> {
    let to = decode_address(to)?;
    let blockhash = decode_address(recent_blockhash)
        .map_err(|e| SettlementError::Chain(format!("bad blockhash from node: {}", e)))?;
    let from_key = from.verifying_key().to_bytes();

    if from_key == to {
        return Err(SettlementError::Validation(
            "transfer source and destination are the same".to_string(),
        ));
    }

    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER.to_le_bytes());
    data.extend_from_slice(&amount.to_le_bytes());

    let mut message = Vec::with_capacity(160);
    // 1 signer, 0 readonly signed, 1 readonly unsigned (system program)
    message.extend_from_slice(&[1, 0, 1]);
    encode_len(&mut message, 3);
    message.extend_from_slice(&from_key);
    message.extend_from_slice(&to);
    message.extend_from_slice(&SYSTEM_PROGRAM_ID);
    message.extend_from_slice(&blockhash);
    encode_len(&mut message, 1);
    message.push(2);
    encode_len(&mut message, 2);
    message.extend_from_slice(&[0, 1]);
    encode_len(&mut message, data.len());
    message.extend_from_slice(&data);

    let signature = from.sign(&message).to_bytes();

    let mut wire = Vec::with_capacity(1 + signature.len() + message.len());
    encode_len(&mut wire, 1);
    wire.extend_from_slice(&signature);
    wire.extend_from_slice(&message);

    Ok(SignedTransfer {
        wire,
        signature: bs58::encode(signature).into_string(),
    })
}

/// Compact-u16 length prefix.
fn encode_len(out: &mut Vec<u8>, len: usize) {
    let mut rem = len as u16;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            out.push(byte);
            break;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

/// Source address (base58) of a wire transfer produced by
/// [`build_transfer`].
pub fn wire_source(wire: &[u8]) -> Option<String> {
    // 1 (sig count) + 64 (sig) + 3 (header) + 1 (key count)
    const FROM_OFFSET: usize = 69;
    let key = wire.get(FROM_OFFSET..FROM_OFFSET + 32)?;
    Some(bs58::encode(key).into_string())
}
