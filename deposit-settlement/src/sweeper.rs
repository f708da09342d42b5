// Copyright (c) 2024 Botho Foundation

//! Moves deposit balances to the treasury and disposes of deposit keys.
//!
//! Every sweep, whether triggered right after completion, by the periodic
//! pass, or manually, goes through [`Sweeper::sweep`], which claims the
//! attempt id in a process-wide in-progress set first. A second caller for
//! the same id returns immediately. Only COMPLETED or EXPIRED attempts
//! are swept; an open attempt's address still expects deposits. The sealed
//! key is cleared only after the transfer was accepted by the node; on any
//! transfer failure it stays in the ledger for the next pass.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    chain::{
        transfer::{build_transfer, TRANSFER_FEE},
        ChainClient,
    },
    error::{SettlementError, SettlementResult},
    claim::ClaimSet,
    events::{EventBus, SettlementEvent},
    issuer::{encode_address, signing_key_from_secret},
    ledger::Ledger,
    model::AttemptId,
    vault::KeyVault,
};

/// Sweeps deposit addresses into the treasury.
pub struct Sweeper {
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn ChainClient>,
    vault: Arc<KeyVault>,
    treasury: String,
    bus: EventBus,
    in_progress: ClaimSet,
}

impl Sweeper {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn ChainClient>,
        vault: Arc<KeyVault>,
        treasury: &str,
        bus: EventBus,
    ) -> Self {
        Self {
            ledger,
            chain,
            vault,
            treasury: treasury.to_string(),
            bus,
            in_progress: ClaimSet::new(),
        }
    }

    /// Whether a sweep for `id` is currently running.
    pub fn is_sweeping(&self, id: &AttemptId) -> bool {
        self.in_progress.contains(id)
    }

    /// Sweep the deposit address of attempt `id`.
    ///
    /// Returns the transfer signature, or `None` when nothing was sent
    /// (another sweep in progress, no key held, balance too low, or the
    /// transfer failed and will be retried). Sweeping an attempt that is
    /// still open and key custody failures are errors.
    pub async fn sweep(&self, id: &AttemptId) -> SettlementResult<Option<String>> {
        let Some(_claim) = self.in_progress.claim(id) else {
            debug!("Sweep already in progress for attempt {}", id);
            return Ok(None);
        };

        let attempt = self
            .ledger
            .get_attempt(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(id.clone()))?;

        if !attempt.is_terminal() {
            return Err(SettlementError::Validation(format!(
                "attempt {} is {}; only COMPLETED or EXPIRED attempts can be swept",
                id, attempt.status
            )));
        }
        let Some(address) = attempt.deposit_address() else {
            debug!("Attempt {} has no deposit address to sweep", id);
            return Ok(None);
        };
        let Some(sealed) = attempt.encrypted_private_key.as_deref() else {
            debug!("Attempt {} was already swept", id);
            return Ok(None);
        };

        let secret = self.vault.decrypt(sealed)?;
        let signing_key = signing_key_from_secret(&secret)?;
        drop(secret);
        if encode_address(&signing_key.verifying_key()) != address {
            return Err(SettlementError::Crypto(format!(
                "sealed key for attempt {} does not match its deposit address",
                id
            )));
        }

        let (signature, amount) = match self.transfer_balance(&signing_key, address).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Sweep of attempt {} failed, key kept for retry: {}", id, e);
                return Ok(None);
            }
        };

        self.ledger.clear_encrypted_key(id).await?;
        info!(
            "Swept {} base units from {} to treasury (attempt {}, tx {})",
            amount, address, id, signature
        );
        self.bus.publish(SettlementEvent::Swept {
            attempt_id: id.clone(),
            signature: signature.clone(),
            amount,
        });

        Ok(Some(signature))
    }

    async fn transfer_balance(
        &self,
        signing_key: &ed25519_dalek::SigningKey,
        address: &str,
    ) -> SettlementResult<(String, u64)> {
        let balance = self.chain.balance(address).await?;
        if balance <= TRANSFER_FEE {
            return Err(SettlementError::SweepFailed(format!(
                "balance {} at {} does not cover the {} fee",
                balance, address, TRANSFER_FEE
            )));
        }
        let amount = balance - TRANSFER_FEE;

        let blockhash = self.chain.latest_blockhash().await?;
        let transfer = build_transfer(signing_key, &self.treasury, amount, &blockhash)?;
        let signature = self
            .chain
            .send_transaction(&transfer.wire)
            .await
            .map_err(|e| SettlementError::SweepFailed(e.to_string()))?;

        Ok((signature, amount))
    }

    /// Sweep every COMPLETED attempt still holding a key.
    ///
    /// Returns how many transfers were sent. Per-attempt errors are logged.
    pub async fn sweep_completed(&self) -> SettlementResult<usize> {
        let mut swept = 0;
        for attempt in self.ledger.unswept_completed().await? {
            if attempt.deposit_address().is_none() {
                continue;
            }
            match self.sweep(&attempt.id).await {
                Ok(Some(_)) => swept += 1,
                Ok(None) => {}
                Err(e) => warn!("Sweep of attempt {} aborted: {}", attempt.id, e),
            }
        }
        Ok(swept)
    }
}
