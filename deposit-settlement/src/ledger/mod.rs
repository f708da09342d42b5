// Copyright (c) 2024 Botho Foundation

//! Durable store of payment attempts and their credited transactions.
//!
//! The ledger is the single source of truth for attempt status and amounts.
//! Two uniqueness rules are enforced here rather than by callers:
//!
//! - a transaction signature is recorded at most once across all attempts
//! - a deposit address belongs to at most one non-terminal attempt

mod sqlite;

pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::SettlementResult,
    model::{AttemptId, AttemptStatus, NewTransfer, PaymentAttempt, Transaction},
};

/// Result of crediting a transfer.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    /// The signature was already recorded; nothing changed.
    Duplicate,
    /// The transfer was stored and credited.
    Credited {
        /// The attempt after crediting
        attempt: PaymentAttempt,
        /// Status before this transfer was applied
        previous_status: AttemptStatus,
    },
}

impl RecordOutcome {
    /// True only for the single transfer that moved the attempt into
    /// COMPLETED.
    pub fn completed_now(&self) -> bool {
        match self {
            RecordOutcome::Credited {
                attempt,
                previous_status,
            } => *previous_status != AttemptStatus::Completed
                && attempt.status == AttemptStatus::Completed,
            RecordOutcome::Duplicate => false,
        }
    }
}

/// Storage for attempts and transactions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Persist a new attempt.
    async fn insert_attempt(&self, attempt: PaymentAttempt) -> SettlementResult<()>;

    async fn get_attempt(&self, id: &AttemptId) -> SettlementResult<Option<PaymentAttempt>>;

    /// Find the attempt owning a deposit address, preferring a non-terminal
    /// one.
    async fn get_attempt_by_address(
        &self,
        address: &str,
    ) -> SettlementResult<Option<PaymentAttempt>>;

    /// All attempts in PENDING or PARTIAL.
    async fn pending_attempts(&self) -> SettlementResult<Vec<PaymentAttempt>>;

    /// Atomically record a transfer and advance its attempt.
    ///
    /// The signature check, transaction insert, credit and status
    /// transition happen as one unit, so concurrent callers observe exactly
    /// one transition into COMPLETED.
    async fn record_transfer(
        &self,
        transfer: NewTransfer,
        now: DateTime<Utc>,
    ) -> SettlementResult<RecordOutcome>;

    /// Move every PENDING or PARTIAL attempt whose `expires_at` is before
    /// `now` to EXPIRED. Returns the ids that changed.
    async fn expire_stale(&self, now: DateTime<Utc>) -> SettlementResult<Vec<AttemptId>>;

    /// Drop the sealed deposit key after a successful sweep.
    async fn clear_encrypted_key(&self, id: &AttemptId) -> SettlementResult<()>;

    async fn transactions_for(&self, id: &AttemptId) -> SettlementResult<Vec<Transaction>>;

    async fn transaction_by_signature(
        &self,
        signature: &str,
    ) -> SettlementResult<Option<Transaction>>;

    /// COMPLETED attempts still holding a sealed deposit key.
    async fn unswept_completed(&self) -> SettlementResult<Vec<PaymentAttempt>>;

    /// Store the credential issued for a completed attempt.
    async fn set_credential(&self, id: &AttemptId, credential_ref: &str) -> SettlementResult<()>;

    /// COMPLETED attempts with no credential recorded.
    async fn pending_provisioning(&self) -> SettlementResult<Vec<PaymentAttempt>>;
}
