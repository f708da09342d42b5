// Copyright (c) 2024 Botho Foundation

//! SQLite ledger.
//!
//! Any number of handles, in this process or others, may open the same
//! database file. Every mutation runs inside one `BEGIN IMMEDIATE`
//! transaction, so a failed write leaves no trace and concurrent writers
//! are serialized by SQLite itself.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Params, Row, TransactionBehavior,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Ledger, RecordOutcome};
use crate::{
    error::{SettlementError, SettlementResult},
    model::{AttemptId, AttemptStatus, DepositMethod, NewTransfer, PaymentAttempt, Transaction},
};

/// How long a writer waits for another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ATTEMPT_COLUMNS: &str = "id, owner_id, tier, duration_units, amount_expected, \
     amount_paid, status, deposit_address, memo, encrypted_private_key, credential_ref, \
     expires_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, payment_attempt_id, signature, amount, \
     sender_address, confirmations, verified_at, created_at";

/// Ledger stored in a SQLite database.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the database at `path` and apply the schema.
    pub fn open(path: &Path) -> SettlementResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        info!("Opened ledger at {:?} (journal mode {})", path, mode);
        Ok(ledger)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> SettlementResult<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> SettlementResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS payment_attempts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                duration_units INTEGER NOT NULL,
                amount_expected INTEGER NOT NULL,
                amount_paid INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                deposit_address TEXT,
                memo TEXT,
                encrypted_private_key BLOB,
                credential_ref TEXT,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_status ON payment_attempts(status);
            CREATE INDEX IF NOT EXISTS idx_attempts_deposit_addr
                ON payment_attempts(deposit_address);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_open_deposit_addr
                ON payment_attempts(deposit_address)
                WHERE status IN ('PENDING', 'PARTIAL');

            CREATE TABLE IF NOT EXISTS payment_transactions (
                id TEXT PRIMARY KEY,
                payment_attempt_id TEXT NOT NULL REFERENCES payment_attempts(id),
                signature TEXT NOT NULL UNIQUE,
                amount INTEGER NOT NULL,
                sender_address TEXT NOT NULL,
                confirmations INTEGER NOT NULL,
                verified_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_attempt
                ON payment_transactions(payment_attempt_id);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> SettlementResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SettlementError::Ledger(format!("Lock error: {}", e)))
    }
}

fn select_attempt(conn: &Connection, id: &AttemptId) -> SettlementResult<Option<PaymentAttempt>> {
    let attempt = conn
        .query_row(
            &format!("SELECT {} FROM payment_attempts WHERE id = ?1", ATTEMPT_COLUMNS),
            params![id.as_str()],
            row_to_attempt,
        )
        .optional()?;
    Ok(attempt)
}

fn query_attempts<P: Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> SettlementResult<Vec<PaymentAttempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM payment_attempts {}",
        ATTEMPT_COLUMNS, clause
    ))?;
    let attempts = stmt
        .query_map(params, row_to_attempt)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(attempts)
}

fn attempt_exists(conn: &Connection, id: &AttemptId) -> SettlementResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM payment_attempts WHERE id = ?1)",
        params![id.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Amounts are u64 in memory and INTEGER (i64) on disk.
fn to_sql_amount(value: u64) -> SettlementResult<i64> {
    i64::try_from(value)
        .map_err(|_| SettlementError::Ledger(format!("amount {} exceeds storage range", value)))
}

fn get_amount(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn conversion_error(idx: usize, err: SettlementError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<PaymentAttempt> {
    let id: String = row.get(0)?;
    let status_str: String = row.get(6)?;
    let deposit_address: Option<String> = row.get(7)?;
    let memo: Option<String> = row.get(8)?;

    let status = status_str
        .parse::<AttemptStatus>()
        .map_err(|e| conversion_error(6, e))?;
    let deposit = match (deposit_address, memo) {
        (Some(address), _) => DepositMethod::Address(address),
        (None, Some(memo)) => DepositMethod::Memo(memo),
        (None, None) => {
            return Err(conversion_error(
                7,
                SettlementError::Ledger(format!("attempt {} has no deposit method", id)),
            ))
        }
    };

    Ok(PaymentAttempt {
        id: AttemptId::from(id),
        owner_id: row.get(1)?,
        tier: row.get(2)?,
        duration_units: row.get(3)?,
        amount_expected: get_amount(row, 4)?,
        amount_paid: get_amount(row, 5)?,
        status,
        deposit,
        encrypted_private_key: row.get(9)?,
        credential_ref: row.get(10)?,
        expires_at: get_time(row, 11)?,
        created_at: get_time(row, 12)?,
        updated_at: get_time(row, 13)?,
    })
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let attempt_id: String = row.get(1)?;
    Ok(Transaction {
        id: row.get(0)?,
        payment_attempt_id: AttemptId::from(attempt_id),
        signature: row.get(2)?,
        amount: get_amount(row, 3)?,
        sender_address: row.get(4)?,
        confirmations: get_amount(row, 5)?,
        verified_at: get_time(row, 6)?,
        created_at: get_time(row, 7)?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn insert_attempt(&self, attempt: PaymentAttempt) -> SettlementResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if attempt_exists(&tx, &attempt.id)? {
            return Err(SettlementError::Ledger(format!(
                "attempt {} already exists",
                attempt.id
            )));
        }
        if let Some(address) = attempt.deposit_address() {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM payment_attempts \
                 WHERE deposit_address = ?1 AND status IN ('PENDING', 'PARTIAL'))",
                params![address],
                |row| row.get(0),
            )?;
            if taken {
                return Err(SettlementError::Ledger(format!(
                    "deposit address {} is already assigned to an open attempt",
                    address
                )));
            }
        }

        let (deposit_address, memo) = match &attempt.deposit {
            DepositMethod::Address(address) => (Some(address.as_str()), None),
            DepositMethod::Memo(memo) => (None, Some(memo.as_str())),
        };
        tx.execute(
            &format!(
                "INSERT INTO payment_attempts ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                ATTEMPT_COLUMNS
            ),
            params![
                attempt.id.as_str(),
                attempt.owner_id,
                attempt.tier,
                attempt.duration_units,
                to_sql_amount(attempt.amount_expected)?,
                to_sql_amount(attempt.amount_paid)?,
                attempt.status.to_string(),
                deposit_address,
                memo,
                attempt.encrypted_private_key,
                attempt.credential_ref,
                attempt.expires_at.timestamp_millis(),
                attempt.created_at.timestamp_millis(),
                attempt.updated_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;

        debug!("Inserted attempt {}", attempt.id);
        Ok(())
    }

    async fn get_attempt(&self, id: &AttemptId) -> SettlementResult<Option<PaymentAttempt>> {
        select_attempt(&*self.conn()?, id)
    }

    async fn get_attempt_by_address(
        &self,
        address: &str,
    ) -> SettlementResult<Option<PaymentAttempt>> {
        let conn = self.conn()?;
        let attempt = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payment_attempts WHERE deposit_address = ?1 \
                     ORDER BY CASE WHEN status IN ('PENDING', 'PARTIAL') THEN 0 ELSE 1 END, \
                     created_at DESC, rowid DESC LIMIT 1",
                    ATTEMPT_COLUMNS
                ),
                params![address],
                row_to_attempt,
            )
            .optional()?;
        Ok(attempt)
    }

    async fn pending_attempts(&self) -> SettlementResult<Vec<PaymentAttempt>> {
        query_attempts(
            &*self.conn()?,
            "WHERE status IN ('PENDING', 'PARTIAL') ORDER BY created_at, rowid",
            [],
        )
    }

    async fn record_transfer(
        &self,
        transfer: NewTransfer,
        now: DateTime<Utc>,
    ) -> SettlementResult<RecordOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recorded: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM payment_transactions WHERE signature = ?1)",
            params![transfer.signature],
            |row| row.get(0),
        )?;
        if recorded {
            return Ok(RecordOutcome::Duplicate);
        }

        let attempt = select_attempt(&tx, &transfer.attempt_id)?
            .ok_or_else(|| SettlementError::NotFound(transfer.attempt_id.clone()))?;

        let previous_status = attempt.status;
        let amount_paid = attempt
            .amount_paid
            .checked_add(transfer.amount)
            .ok_or_else(|| {
                SettlementError::Validation(format!(
                    "credit of {} overflows attempt {}",
                    transfer.amount, attempt.id
                ))
            })?;

        let status = if previous_status.is_terminal() {
            previous_status
        } else if amount_paid >= attempt.amount_expected {
            AttemptStatus::Completed
        } else if amount_paid > 0 {
            AttemptStatus::Partial
        } else {
            previous_status
        };
        debug_assert!(status == previous_status || previous_status.can_advance_to(status));

        tx.execute(
            &format!(
                "INSERT INTO payment_transactions ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                TRANSACTION_COLUMNS
            ),
            params![
                Uuid::new_v4().to_string(),
                transfer.attempt_id.as_str(),
                transfer.signature,
                to_sql_amount(transfer.amount)?,
                transfer.sender,
                to_sql_amount(transfer.confirmations)?,
                now.timestamp_millis(),
                now.timestamp_millis(),
            ],
        )?;
        tx.execute(
            "UPDATE payment_attempts SET amount_paid = ?1, status = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![
                to_sql_amount(amount_paid)?,
                status.to_string(),
                now.timestamp_millis(),
                attempt.id.as_str(),
            ],
        )?;
        tx.commit()?;

        let mut updated = attempt;
        updated.amount_paid = amount_paid;
        updated.status = status;
        updated.updated_at = now;

        Ok(RecordOutcome::Credited {
            attempt: updated,
            previous_status,
        })
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> SettlementResult<Vec<AttemptId>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_ms = now.timestamp_millis();

        let expired: Vec<AttemptId> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM payment_attempts \
                 WHERE status IN ('PENDING', 'PARTIAL') AND expires_at < ?1 \
                 ORDER BY created_at, rowid",
            )?;
            let ids = stmt
                .query_map(params![now_ms], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids.into_iter().map(AttemptId::from).collect()
        };

        if !expired.is_empty() {
            tx.execute(
                "UPDATE payment_attempts SET status = 'EXPIRED', updated_at = ?1 \
                 WHERE status IN ('PENDING', 'PARTIAL') AND expires_at < ?1",
                params![now_ms],
            )?;
        }
        tx.commit()?;

        Ok(expired)
    }

    async fn clear_encrypted_key(&self, id: &AttemptId) -> SettlementResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE payment_attempts SET encrypted_private_key = NULL, updated_at = ?1 \
             WHERE id = ?2 AND encrypted_private_key IS NOT NULL",
            params![Utc::now().timestamp_millis(), id.as_str()],
        )?;

        if changed == 0 && !attempt_exists(&conn, id)? {
            return Err(SettlementError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn transactions_for(&self, id: &AttemptId) -> SettlementResult<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payment_transactions WHERE payment_attempt_id = ?1 \
             ORDER BY created_at, rowid",
            TRANSACTION_COLUMNS
        ))?;
        let transactions = stmt
            .query_map(params![id.as_str()], row_to_transaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(transactions)
    }

    async fn transaction_by_signature(
        &self,
        signature: &str,
    ) -> SettlementResult<Option<Transaction>> {
        let conn = self.conn()?;
        let transaction = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payment_transactions WHERE signature = ?1",
                    TRANSACTION_COLUMNS
                ),
                params![signature],
                row_to_transaction,
            )
            .optional()?;
        Ok(transaction)
    }

    async fn unswept_completed(&self) -> SettlementResult<Vec<PaymentAttempt>> {
        query_attempts(
            &*self.conn()?,
            "WHERE status = 'COMPLETED' AND encrypted_private_key IS NOT NULL \
             AND deposit_address IS NOT NULL ORDER BY created_at, rowid",
            [],
        )
    }

    async fn set_credential(&self, id: &AttemptId, credential_ref: &str) -> SettlementResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE payment_attempts SET credential_ref = ?1, updated_at = ?2 WHERE id = ?3",
            params![credential_ref, Utc::now().timestamp_millis(), id.as_str()],
        )?;
        if changed == 0 {
            return Err(SettlementError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn pending_provisioning(&self) -> SettlementResult<Vec<PaymentAttempt>> {
        query_attempts(
            &*self.conn()?,
            "WHERE status = 'COMPLETED' AND credential_ref IS NULL ORDER BY updated_at, rowid",
            [],
        )
    }
}
