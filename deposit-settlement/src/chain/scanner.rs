// Copyright (c) 2024 Botho Foundation

//! Deposit detection over an address's recent chain history.
//!
//! For every signature touching an address the scanner fetches the parsed
//! transaction, diffs pre/post balances to find what was credited, and
//! reports candidates above a tolerance-adjusted floor. Individual fetch or
//! parse failures are logged and skipped; only failures of the history
//! query itself abort a scan.
//!
//! Deposit addresses are single-use, so one page of history covers them.
//! The shared memo address is busy, so memo scans page backwards until
//! they reach signatures older than the attempt.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChainClient, ParsedTransaction, SignatureInfo};
use crate::error::SettlementResult;

/// Basis-point denominator for the tolerance factor.
const BPS: u128 = 10_000;

/// Default bound on history pages fetched per memo scan.
pub const DEFAULT_MEMO_PAGES: usize = 10;

/// A transfer found on chain that may settle an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTransfer {
    /// Transaction signature
    pub signature: String,
    /// Slot the transaction landed in
    pub slot: u64,
    /// Address credited
    pub recipient: String,
    /// Address that funded the transfer
    pub sender: String,
    /// Base units credited to the recipient
    pub amount: u64,
    /// Slots since inclusion
    pub confirmations: u64,
    /// First memo attached to the transaction, if any
    pub memo: Option<String>,
}

/// Scans chain history for deposits.
pub struct ChainScanner {
    client: Arc<dyn ChainClient>,
    /// Fraction of the floor a transfer must reach, in basis points
    tolerance_bps: u64,
    /// Pause between consecutive transaction fetches
    rpc_delay: Duration,
    /// Most history pages a memo scan walks
    memo_pages: usize,
}

impl ChainScanner {
    pub fn new(client: Arc<dyn ChainClient>, tolerance_bps: u64, rpc_delay: Duration) -> Self {
        Self {
            client,
            tolerance_bps,
            rpc_delay,
            memo_pages: DEFAULT_MEMO_PAGES,
        }
    }

    pub fn with_memo_pages(mut self, pages: usize) -> Self {
        self.memo_pages = pages.max(1);
        self
    }

    /// The underlying chain client.
    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    /// Transfers into `address` worth at least `min_amount` (after
    /// tolerance), from the newest `max_results` signatures.
    pub async fn scan(
        &self,
        address: &str,
        min_amount: u64,
        max_results: usize,
    ) -> SettlementResult<Vec<CandidateTransfer>> {
        let signatures = self.history(address, max_results, 1, None).await?;
        self.scan_filtered(address, &signatures, min_amount, |_| true)
            .await
    }

    /// Legacy memo detection: transfers into the shared `memo_address`
    /// carrying `memo`.
    ///
    /// Pages of `page_size` signatures are fetched newest first until a
    /// page reaches back before `since`, history runs out, or the page
    /// bound is hit.
    pub async fn scan_memo(
        &self,
        memo_address: &str,
        memo: &str,
        min_amount: u64,
        page_size: usize,
        since: DateTime<Utc>,
    ) -> SettlementResult<Vec<CandidateTransfer>> {
        let signatures = self
            .history(memo_address, page_size, self.memo_pages, Some(since.timestamp()))
            .await?;
        self.scan_filtered(memo_address, &signatures, min_amount, |tx| {
            tx.memos.iter().any(|m| m.trim() == memo)
        })
        .await
    }

    /// Look up a single signature and report the transfer it carries.
    ///
    /// The recipient is the account credited the most, excluding the fee
    /// payer. Returns `None` for unknown, failed or non-crediting
    /// transactions.
    pub async fn verify_signature(
        &self,
        signature: &str,
    ) -> SettlementResult<Option<CandidateTransfer>> {
        let current_slot = self.client.current_slot().await?;
        let Some(tx) = self.client.transaction(signature).await? else {
            return Ok(None);
        };
        if tx.failed {
            return Ok(None);
        }

        Ok(tx
            .largest_credit()
            .and_then(|(recipient, _)| to_candidate(&tx, &recipient, current_slot)))
    }

    /// Up to `max_pages` pages of history, newest first. Paging stops early
    /// once a page ends before `since` (unix seconds).
    async fn history(
        &self,
        address: &str,
        page_size: usize,
        max_pages: usize,
        since: Option<i64>,
    ) -> SettlementResult<Vec<SignatureInfo>> {
        let mut signatures: Vec<SignatureInfo> = Vec::new();

        for _ in 0..max_pages.max(1) {
            let before = signatures.last().map(|s| s.signature.clone());
            let page = self
                .client
                .signatures_for_address(address, page_size, before.as_deref())
                .await?;

            let exhausted = page.is_empty() || page.len() < page_size;
            let reached_since = match (since, page.last().and_then(|s| s.block_time)) {
                (Some(since), Some(time)) => time < since,
                _ => false,
            };
            signatures.extend(page);
            if exhausted || reached_since {
                break;
            }
        }

        Ok(signatures)
    }

    async fn scan_filtered<F>(
        &self,
        address: &str,
        signatures: &[SignatureInfo],
        min_amount: u64,
        mut keep: F,
    ) -> SettlementResult<Vec<CandidateTransfer>>
    where
        F: FnMut(&ParsedTransaction) -> bool + Send,
    {
        let current_slot = self.client.current_slot().await?;

        let mut candidates = Vec::new();
        for (i, info) in signatures.iter().enumerate() {
            if info.failed {
                debug!("Skipping failed transaction {}", info.signature);
                continue;
            }
            if i > 0 && !self.rpc_delay.is_zero() {
                tokio::time::sleep(self.rpc_delay).await;
            }

            let tx = match self.client.transaction(&info.signature).await {
                Ok(Some(tx)) => tx,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "Failed to fetch transaction {} for {}: {}",
                        info.signature, address, e
                    );
                    continue;
                }
            };
            if tx.failed || !keep(&tx) {
                continue;
            }

            let Some(candidate) = to_candidate(&tx, address, current_slot) else {
                continue;
            };
            if !self.meets_floor(candidate.amount, min_amount) {
                debug!(
                    "Ignoring transfer {} of {} to {} below floor {}",
                    candidate.signature, candidate.amount, address, min_amount
                );
                continue;
            }
            candidates.push(candidate);
        }

        Ok(candidates)
    }

    /// `amount >= min_amount * tolerance`.
    fn meets_floor(&self, amount: u64, min_amount: u64) -> bool {
        amount as u128 * BPS >= min_amount as u128 * self.tolerance_bps as u128
    }
}

fn to_candidate(
    tx: &ParsedTransaction,
    recipient: &str,
    current_slot: u64,
) -> Option<CandidateTransfer> {
    let delta = tx.balance_delta(recipient)?;
    if delta <= 0 {
        return None;
    }

    Some(CandidateTransfer {
        signature: tx.signature.clone(),
        slot: tx.slot,
        recipient: recipient.to_string(),
        sender: tx.sender_for(recipient)?,
        amount: u64::try_from(delta).ok()?,
        confirmations: current_slot.saturating_sub(tx.slot),
        memo: tx.memos.first().cloned(),
    })
}
