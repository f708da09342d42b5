// Copyright (c) 2024 Botho Foundation

//! Scripted in-memory chain for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{transfer::wire_source, AccountRef, ChainClient, ParsedTransaction, SignatureInfo};
use crate::error::{SettlementError, SettlementResult};

const MOCK_FEE: u64 = 5_000;
const MOCK_BLOCKHASH: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

#[derive(Default)]
struct State {
    slot: u64,
    /// Per address, oldest first
    history: HashMap<String, Vec<SignatureInfo>>,
    transactions: HashMap<String, ParsedTransaction>,
    broken: HashSet<String>,
    balances: HashMap<String, u64>,
    sent: Vec<Vec<u8>>,
    offline: bool,
    reject_sends: bool,
    next_sig: u64,
}

pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(slot: u64) -> Self {
        Self {
            state: Mutex::new(State {
                slot,
                ..Default::default()
            }),
        }
    }

    /// Record a confirmed transfer and return its signature. Its block time
    /// is the slot number, in seconds.
    pub fn add_transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        slot: u64,
        memo: Option<&str>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_sig += 1;
        let signature = format!("sig-{}", state.next_sig);

        let from_pre = state.balances.get(from).copied().unwrap_or(0) + amount + MOCK_FEE;
        let to_pre = state.balances.get(to).copied().unwrap_or(0);
        state.balances.insert(from.to_string(), from_pre - amount - MOCK_FEE);
        state.balances.insert(to.to_string(), to_pre + amount);

        let tx = ParsedTransaction {
            signature: signature.clone(),
            slot,
            failed: false,
            account_keys: vec![
                AccountRef {
                    pubkey: from.to_string(),
                    signer: true,
                },
                AccountRef {
                    pubkey: to.to_string(),
                    signer: false,
                },
            ],
            pre_balances: vec![from_pre, to_pre],
            post_balances: vec![from_pre - amount - MOCK_FEE, to_pre + amount],
            memos: memo.map(|m| vec![m.to_string()]).unwrap_or_default(),
        };

        for address in [from, to] {
            state
                .history
                .entry(address.to_string())
                .or_default()
                .push(SignatureInfo {
                    signature: signature.clone(),
                    slot,
                    failed: false,
                    block_time: Some(slot as i64),
                });
        }
        state.transactions.insert(signature.clone(), tx);
        signature
    }

    pub fn mark_failed(&self, signature: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.transactions.get_mut(signature) {
            tx.failed = true;
        }
        for entries in state.history.values_mut() {
            for e in entries.iter_mut().filter(|e| e.signature == signature) {
                e.failed = true;
            }
        }
    }

    /// Make fetching this transaction return an error.
    pub fn break_transaction(&self, signature: &str) {
        self.state
            .lock()
            .unwrap()
            .broken
            .insert(signature.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn reject_sends(&self, reject: bool) {
        self.state.lock().unwrap().reject_sends = reject;
    }

    pub fn set_balance(&self, address: &str, balance: u64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(address.to_string(), balance);
    }

    /// Wire transactions submitted so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    fn check_online(&self) -> SettlementResult<()> {
        if self.state.lock().unwrap().offline {
            return Err(SettlementError::Chain("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_slot(&self) -> SettlementResult<u64> {
        self.check_online()?;
        Ok(self.state.lock().unwrap().slot)
    }

    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SettlementResult<Vec<SignatureInfo>> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        let newest_first: Vec<&SignatureInfo> = state
            .history
            .get(address)
            .map(|h| h.iter().rev().collect())
            .unwrap_or_default();
        let start = match before {
            Some(cursor) => newest_first
                .iter()
                .position(|e| e.signature == cursor)
                .map_or(newest_first.len(), |i| i + 1),
            None => 0,
        };
        Ok(newest_first[start..]
            .iter()
            .take(limit)
            .map(|e| (*e).clone())
            .collect())
    }

    async fn transaction(&self, signature: &str) -> SettlementResult<Option<ParsedTransaction>> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        if state.broken.contains(signature) {
            return Err(SettlementError::Chain(format!("malformed payload for {}", signature)));
        }
        Ok(state.transactions.get(signature).cloned())
    }

    async fn balance(&self, address: &str) -> SettlementResult<u64> {
        self.check_online()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn latest_blockhash(&self) -> SettlementResult<String> {
        self.check_online()?;
        Ok(MOCK_BLOCKHASH.to_string())
    }

    async fn send_transaction(&self, wire: &[u8]) -> SettlementResult<String> {
        self.check_online()?;
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        if state.reject_sends {
            return Err(SettlementError::Chain("insufficient funds for fee".to_string()));
        }
        if let Some(source) = wire_source(wire) {
            state.balances.insert(source, 0);
        }
        state.sent.push(wire.to_vec());
        state.next_sig += 1;
        Ok(format!("sweep-{}", state.next_sig))
    }
}
