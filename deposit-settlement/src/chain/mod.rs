// Copyright (c) 2024 Botho Foundation

//! Chain access: the RPC capability, transfer encoding, and the scanner
//! that turns raw chain history into candidate deposits.

#[cfg(test)]
pub mod mock;
mod rpc;
mod scanner;
pub mod transfer;

pub use rpc::RpcChainClient;
pub use scanner::{CandidateTransfer, ChainScanner};

use async_trait::async_trait;

use crate::error::SettlementResult;

/// One entry of an address's signature history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    /// The transaction executed with an error
    pub failed: bool,
    /// Estimated production time (unix seconds), when the node knows it
    pub block_time: Option<i64>,
}

/// An account referenced by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRef {
    pub pubkey: String,
    pub signer: bool,
}

/// The parts of a confirmed transaction the scanner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransaction {
    pub signature: String,
    pub slot: u64,
    pub failed: bool,
    pub account_keys: Vec<AccountRef>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    /// Text of every memo instruction, in order
    pub memos: Vec<String>,
}

impl ParsedTransaction {
    /// Net balance change of `address`, if it takes part in the transaction.
    pub fn balance_delta(&self, address: &str) -> Option<i128> {
        let index = self.account_keys.iter().position(|k| k.pubkey == address)?;
        self.delta_at(index)
    }

    fn delta_at(&self, index: usize) -> Option<i128> {
        let pre = *self.pre_balances.get(index)?;
        let post = *self.post_balances.get(index)?;
        Some(post as i128 - pre as i128)
    }

    /// The fee payer (first account key).
    pub fn fee_payer(&self) -> Option<&str> {
        self.account_keys.first().map(|k| k.pubkey.as_str())
    }

    /// The account other than `recipient` whose balance dropped the most,
    /// falling back to the fee payer.
    pub fn sender_for(&self, recipient: &str) -> Option<String> {
        self.account_keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.pubkey != recipient)
            .filter_map(|(i, k)| self.delta_at(i).map(|d| (d, k)))
            .filter(|(d, _)| *d < 0)
            .min_by_key(|(d, _)| *d)
            .map(|(_, k)| k.pubkey.clone())
            .or_else(|| self.fee_payer().map(str::to_string))
    }

    /// The account with the largest credit other than the fee payer.
    pub fn largest_credit(&self) -> Option<(String, u64)> {
        let payer = self.fee_payer();
        self.account_keys
            .iter()
            .enumerate()
            .filter(|(_, k)| Some(k.pubkey.as_str()) != payer)
            .filter_map(|(i, k)| self.delta_at(i).map(|d| (d, k)))
            .filter(|(d, _)| *d > 0)
            .max_by_key(|(d, _)| *d)
            .map(|(d, k)| (k.pubkey.clone(), d as u64))
    }
}

/// Capability to read from and submit to the chain.
///
/// Chosen once at startup; the engine never resolves clients dynamically.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current slot (block height).
    async fn current_slot(&self) -> SettlementResult<u64>;

    /// Signatures involving `address`, newest first.
    ///
    /// With `before`, the page starts just below that signature.
    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SettlementResult<Vec<SignatureInfo>>;

    /// Fetch a confirmed transaction; `None` if the node doesn't have it yet.
    async fn transaction(&self, signature: &str) -> SettlementResult<Option<ParsedTransaction>>;

    /// Balance of `address` in base units.
    async fn balance(&self, address: &str) -> SettlementResult<u64>;

    /// Recent blockhash (base58) for building transactions.
    async fn latest_blockhash(&self) -> SettlementResult<String>;

    /// Submit a signed wire transaction and return its signature.
    async fn send_transaction(&self, wire: &[u8]) -> SettlementResult<String>;
}
