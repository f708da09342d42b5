// Copyright (c) 2024 Botho Foundation

//! Integration tests for deposit-settlement
//!
//! These tests drive the public API end to end:
//! - Attempt creation and the partial/complete lifecycle
//! - Idempotent transfer recording
//! - Expiry
//! - Sweep mutual exclusion
//! - Monitor-driven detection
//! - Ledger persistence across restarts, processes and failed writes

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use deposit_settlement::{
    chain::{AccountRef, ParsedTransaction, SignatureInfo},
    config::TierConfig,
    model::parse_amount,
    provision::{Credential, Provisioner},
    AttemptStatus, ChainClient, ChainScanner, EngineSettings, EventBus, KeyVault, Ledger,
    Monitor, MonitorSettings, PaymentAttempt, SettlementEngine, SettlementError,
    SettlementResult, SqliteLedger, Sweeper,
};
use tempfile::TempDir;

const TREASURY: &str = "4Nd1mYj3p7TnZ3n8uT8EVq3QnWJcbKiYt7Xh2M1hZx9c";
const BLOCKHASH: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const VAULT_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

// ============================================================================
// Test doubles
// ============================================================================

/// Chain with scripted deposits and a count of submitted transfers.
#[derive(Default)]
struct TestChain {
    balances: Mutex<HashMap<String, u64>>,
    history: Mutex<HashMap<String, Vec<SignatureInfo>>>,
    transactions: Mutex<HashMap<String, ParsedTransaction>>,
    sends: AtomicUsize,
}

impl TestChain {
    const SLOT: u64 = 500;

    fn fund(&self, address: &str, amount: u64) {
        *self
            .balances
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default() += amount;
    }

    /// Record a confirmed transfer from `payer` into `address`.
    fn deposit(&self, signature: &str, address: &str, amount: u64) {
        let before = self.balances.lock().unwrap().get(address).copied().unwrap_or(0);
        self.fund(address, amount);

        self.transactions.lock().unwrap().insert(
            signature.to_string(),
            ParsedTransaction {
                signature: signature.to_string(),
                slot: Self::SLOT - 3,
                failed: false,
                account_keys: vec![
                    AccountRef {
                        pubkey: "payer".to_string(),
                        signer: true,
                    },
                    AccountRef {
                        pubkey: address.to_string(),
                        signer: false,
                    },
                ],
                pre_balances: vec![amount + 5_000, before],
                post_balances: vec![0, before + amount],
                memos: vec![],
            },
        );
        self.history
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .insert(
                0,
                SignatureInfo {
                    signature: signature.to_string(),
                    slot: Self::SLOT - 3,
                    failed: false,
                    block_time: None,
                },
            );
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for TestChain {
    async fn current_slot(&self) -> SettlementResult<u64> {
        Ok(Self::SLOT)
    }

    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SettlementResult<Vec<SignatureInfo>> {
        let history = self.history.lock().unwrap();
        let Some(entries) = history.get(address) else {
            return Ok(Vec::new());
        };
        let start = before
            .and_then(|cursor| entries.iter().position(|e| e.signature == cursor))
            .map_or(0, |i| i + 1);
        Ok(entries.iter().skip(start).take(limit).cloned().collect())
    }

    async fn transaction(&self, signature: &str) -> SettlementResult<Option<ParsedTransaction>> {
        Ok(self.transactions.lock().unwrap().get(signature).cloned())
    }

    async fn balance(&self, address: &str) -> SettlementResult<u64> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn latest_blockhash(&self) -> SettlementResult<String> {
        Ok(BLOCKHASH.to_string())
    }

    async fn send_transaction(&self, _wire: &[u8]) -> SettlementResult<String> {
        tokio::task::yield_now().await;
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sweep-{}", n))
    }
}

/// Counts calls; fails every call while `down` is set.
#[derive(Default)]
struct CountingProvisioner {
    calls: AtomicUsize,
    down: AtomicBool,
}

impl CountingProvisioner {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for CountingProvisioner {
    async fn provision(&self, attempt: &PaymentAttempt) -> SettlementResult<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(SettlementError::Provisioning(
                "provisioning service returned 503".to_string(),
            ));
        }
        Ok(Credential {
            credential_ref: format!("cred-{}", attempt.id),
        })
    }
}

struct Harness {
    engine: Arc<SettlementEngine>,
    ledger: Arc<SqliteLedger>,
    chain: Arc<TestChain>,
    provisioner: Arc<CountingProvisioner>,
}

fn settings() -> EngineSettings {
    EngineSettings {
        tiers: vec![TierConfig {
            name: "standard".to_string(),
            allocation: 5,
            price_per_unit: parse_amount("1.0").unwrap(),
        }],
        expiry_window: chrono::Duration::minutes(30),
        max_duration_units: 12,
        capacity_total: 100,
    }
}

fn harness_with(ledger: Arc<SqliteLedger>, chain: Arc<TestChain>) -> Harness {
    let vault = Arc::new(KeyVault::from_hex(VAULT_KEY).unwrap());
    let bus = EventBus::default();
    let sweeper = Arc::new(Sweeper::new(
        ledger.clone(),
        chain.clone(),
        vault.clone(),
        TREASURY,
        bus.clone(),
    ));
    let provisioner = Arc::new(CountingProvisioner::default());
    let engine = SettlementEngine::new(settings(), ledger.clone(), vault, sweeper, bus)
        .with_provisioner(provisioner.clone());

    Harness {
        engine: Arc::new(engine),
        ledger,
        chain,
        provisioner,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(SqliteLedger::open_in_memory().unwrap()),
        Arc::new(TestChain::default()),
    )
}

// ============================================================================
// Settlement Lifecycle Tests
// ============================================================================

mod settlement_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_full_payment_lifecycle() {
        let h = harness();

        // 1. Create attempt
        let attempt = h.engine.create_attempt("owner-1", "standard", 1).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert_eq!(attempt.amount_expected, parse_amount("1.000000").unwrap());
        assert_eq!(attempt.amount_paid, 0);
        let address = attempt.deposit_address().unwrap().to_string();
        h.chain.fund(&address, parse_amount("1.0").unwrap());

        // 2. Partial payment
        h.engine
            .record_transaction(&attempt.id, "sig1", parse_amount("0.4").unwrap(), "senderA", 3)
            .await
            .unwrap();
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Partial);
        assert_eq!(current.amount_paid, parse_amount("0.400000").unwrap());

        // 3. Completing payment
        h.engine
            .record_transaction(&attempt.id, "sig2", parse_amount("0.6").unwrap(), "senderA", 3)
            .await
            .unwrap();
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Completed);
        assert_eq!(current.amount_paid, parse_amount("1.000000").unwrap());
        assert_eq!(h.provisioner.calls(), 1);
        assert_eq!(h.chain.sends(), 1);

        // 4. Replay of the first transfer
        h.engine
            .record_transaction(&attempt.id, "sig1", parse_amount("0.4").unwrap(), "senderA", 3)
            .await
            .unwrap();
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.amount_paid, parse_amount("1.0").unwrap());
        assert_eq!(h.engine.transactions_for(&attempt.id).await.unwrap().len(), 2);
        assert_eq!(h.provisioner.calls(), 1);
        assert_eq!(h.chain.sends(), 1);
    }

    #[tokio::test]
    async fn test_address_lookup_after_attempt_is_terminal() {
        let h = harness();
        let paid = h.engine.create_attempt("owner-1", "standard", 1).await.unwrap();
        let unpaid = h.engine.create_attempt("owner-1", "standard", 1).await.unwrap();
        h.engine
            .record_transaction(&paid.id, "sig", parse_amount("1").unwrap(), "payer", 1)
            .await
            .unwrap();
        h.engine
            .mark_expired_at(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let found = h
            .engine
            .get_attempt_by_address(paid.deposit_address().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, paid.id);
        assert_eq!(found.status, AttemptStatus::Completed);

        let found = h
            .engine
            .get_attempt_by_address(unpaid.deposit_address().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, unpaid.id);
        assert_eq!(found.status, AttemptStatus::Expired);

        assert!(h
            .engine
            .get_attempt_by_address(TREASURY)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deposit_addresses_are_unique() {
        let h = harness();
        let mut addresses = std::collections::HashSet::new();
        for _ in 0..10 {
            let attempt = h.engine.create_attempt("owner-1", "standard", 1).await.unwrap();
            assert!(addresses.insert(attempt.deposit_address().unwrap().to_string()));
        }
    }

    #[tokio::test]
    async fn test_amount_paid_never_decreases() {
        let h = harness();
        let attempt = h.engine.create_attempt("owner-1", "standard", 2).await.unwrap();

        let mut last = 0;
        for (i, amount) in [300_000_000u64, 300_000_000, 100, 900_000_000, 600_000_000]
            .iter()
            .enumerate()
        {
            let sig = format!("sig-{}", i % 3);
            h.engine
                .record_transaction(&attempt.id, &sig, *amount, "payer", 1)
                .await
                .unwrap();
            let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
            assert!(current.amount_paid >= last);
            last = current.amount_paid;
        }
    }
}

// ============================================================================
// Expiry Tests
// ============================================================================

mod expiry {
    use super::*;

    #[tokio::test]
    async fn test_unpaid_attempt_expires() {
        let h = harness();
        let attempt = h.engine.create_attempt("owner-2", "standard", 1).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(h.engine.mark_expired_at(later).await.unwrap(), 1);

        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Expired);
        assert!(h.engine.get_pending_attempts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_attempt_never_expires() {
        let h = harness();
        let attempt = h.engine.create_attempt("owner-2", "standard", 1).await.unwrap();
        h.engine
            .record_transaction(&attempt.id, "sig", parse_amount("1").unwrap(), "payer", 1)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::days(30);
        assert_eq!(h.engine.mark_expired_at(later).await.unwrap(), 0);
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Completed);
    }
}

// ============================================================================
// Sweep Tests
// ============================================================================

mod sweep {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_manual_sweeps_transfer_once() {
        let h = harness();
        let attempt = h.engine.create_attempt("owner-3", "standard", 1).await.unwrap();

        // Complete without funds so the post-completion sweep fails
        h.engine
            .record_transaction(&attempt.id, "sig", parse_amount("1").unwrap(), "payer", 1)
            .await
            .unwrap();
        assert_eq!(h.chain.sends(), 0);
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert!(current.encrypted_private_key.is_some());

        h.chain
            .fund(attempt.deposit_address().unwrap(), parse_amount("1").unwrap());
        let (a, b) = tokio::join!(h.engine.sweep(&attempt.id), h.engine.sweep(&attempt.id));
        let successes = [a.unwrap(), b.unwrap()].iter().flatten().count();

        assert_eq!(successes, 1);
        assert_eq!(h.chain.sends(), 1);
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert!(current.encrypted_private_key.is_none());
    }

    #[tokio::test]
    async fn test_partially_paid_attempt_keeps_its_key() {
        let h = harness();
        let attempt = h.engine.create_attempt("owner-3", "standard", 1).await.unwrap();
        let address = attempt.deposit_address().unwrap().to_string();

        h.chain.deposit("first-half", &address, parse_amount("0.5").unwrap());
        h.engine
            .record_transaction(&attempt.id, "first-half", parse_amount("0.5").unwrap(), "payer", 1)
            .await
            .unwrap();
        assert!(matches!(
            h.engine.sweep(&attempt.id).await,
            Err(SettlementError::Validation(_))
        ));
        assert_eq!(h.chain.sends(), 0);

        h.chain.deposit("second-half", &address, parse_amount("0.5").unwrap());
        h.engine
            .record_transaction(&attempt.id, "second-half", parse_amount("0.5").unwrap(), "payer", 1)
            .await
            .unwrap();

        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Completed);
        assert!(current.encrypted_private_key.is_none());
        assert_eq!(h.chain.sends(), 1);
    }
}

// ============================================================================
// Monitor Tests
// ============================================================================

mod monitor {
    use super::*;

    #[tokio::test]
    async fn test_monitor_settles_detected_deposits() {
        let h = harness();
        let attempt = h.engine.create_attempt("owner-4", "standard", 1).await.unwrap();
        let address = attempt.deposit_address().unwrap().to_string();

        let scanner = ChainScanner::new(h.chain.clone(), 9_900, Duration::ZERO);
        let monitor = Monitor::new(
            h.engine.clone(),
            scanner,
            MonitorSettings {
                interval: Duration::from_secs(10),
                memo_address: TREASURY.to_string(),
                dust_threshold: 1_000,
                max_signatures: 20,
            },
        );

        h.chain.deposit("tx-1", &address, parse_amount("0.25").unwrap());
        monitor.tick().await.unwrap();
        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Partial);

        h.chain.deposit("tx-2", &address, parse_amount("0.75").unwrap());
        let summary = monitor.tick().await.unwrap();
        assert_eq!(summary.transfers_recorded, 1);

        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Completed);
        assert!(current.encrypted_private_key.is_none());
        assert_eq!(h.provisioner.calls(), 1);
        assert_eq!(h.chain.sends(), 1);
    }
}

// ============================================================================
// Persistence Tests
// ============================================================================

mod persistence {
    use super::*;

    #[tokio::test]
    async fn test_attempt_survives_restart_and_sweeps() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settlement.db");
        let chain = Arc::new(TestChain::default());

        let attempt = {
            let ledger = Arc::new(SqliteLedger::open(&path).unwrap());
            let h = harness_with(ledger, chain.clone());
            let attempt = h.engine.create_attempt("owner-5", "standard", 1).await.unwrap();
            h.engine
                .record_transaction(&attempt.id, "sig", parse_amount("1").unwrap(), "payer", 1)
                .await
                .unwrap();
            attempt
        };

        // Restart with the same vault key
        let ledger = Arc::new(SqliteLedger::open(&path).unwrap());
        let h = harness_with(ledger, chain.clone());

        let reloaded = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(reloaded.status, AttemptStatus::Completed);
        assert!(reloaded.encrypted_private_key.is_some());
        assert!(h.ledger.transaction_by_signature("sig").await.unwrap().is_some());

        chain.fund(attempt.deposit_address().unwrap(), parse_amount("1").unwrap());
        assert!(h.engine.sweep(&attempt.id).await.unwrap().is_some());
        assert_eq!(h.ledger.unswept_completed().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_monitor_and_cli_share_one_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settlement.db");
        let chain = Arc::new(TestChain::default());

        // A long-running monitor and a one-shot `create` hold separate handles
        let monitor = harness_with(Arc::new(SqliteLedger::open(&path).unwrap()), chain.clone());
        let from_monitor = monitor
            .engine
            .create_attempt("owner-6", "standard", 1)
            .await
            .unwrap();
        let from_cli = {
            let cli = harness_with(Arc::new(SqliteLedger::open(&path).unwrap()), chain.clone());
            cli.engine
                .create_attempt("owner-7", "standard", 1)
                .await
                .unwrap()
        };

        let pending = monitor.engine.get_pending_attempts().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|a| a.id == from_cli.id));

        monitor
            .engine
            .record_transaction(&from_monitor.id, "sig", parse_amount("1").unwrap(), "payer", 1)
            .await
            .unwrap();
        drop(monitor);

        let reopened = SqliteLedger::open(&path).unwrap();
        for attempt in [&from_monitor, &from_cli] {
            let stored = reopened.get_attempt(&attempt.id).await.unwrap().unwrap();
            assert!(stored.encrypted_private_key.is_some());
        }
        let stored = reopened.get_attempt(&from_monitor.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_lose_completion() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settlement.db");
        let h = harness_with(
            Arc::new(SqliteLedger::open(&path).unwrap()),
            Arc::new(TestChain::default()),
        );
        let attempt = h.engine.create_attempt("owner-8", "standard", 1).await.unwrap();

        let admin = rusqlite::Connection::open(&path).unwrap();
        admin
            .execute_batch(
                "CREATE TRIGGER reject_credit BEFORE UPDATE ON payment_attempts \
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let result = h
            .engine
            .record_transaction(&attempt.id, "sig", parse_amount("1").unwrap(), "payer", 1)
            .await;
        assert!(matches!(result, Err(SettlementError::Ledger(_))));
        assert!(h.ledger.transaction_by_signature("sig").await.unwrap().is_none());
        assert_eq!(h.provisioner.calls(), 0);

        admin.execute_batch("DROP TRIGGER reject_credit;").unwrap();
        let outcome = h
            .engine
            .record_transaction(&attempt.id, "sig", parse_amount("1").unwrap(), "payer", 1)
            .await
            .unwrap();
        assert!(outcome.completed_now());
        assert_eq!(h.provisioner.calls(), 1);

        let current = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(current.status, AttemptStatus::Completed);
        assert_eq!(current.credential_ref, Some(format!("cred-{}", attempt.id)));
    }

    #[tokio::test]
    async fn test_failed_provisioning_is_retried_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settlement.db");
        let chain = Arc::new(TestChain::default());

        let attempt = {
            let h = harness_with(Arc::new(SqliteLedger::open(&path).unwrap()), chain.clone());
            h.provisioner.down.store(true, Ordering::SeqCst);
            let attempt = h.engine.create_attempt("owner-9", "standard", 1).await.unwrap();
            let outcome = h
                .engine
                .record_transaction(&attempt.id, "sig", parse_amount("1").unwrap(), "payer", 1)
                .await
                .unwrap();
            assert!(outcome.completed_now());
            assert_eq!(h.provisioner.calls(), 1);
            assert_eq!(h.engine.retry_provisioning().await.unwrap(), 0);
            attempt
        };

        let h = harness_with(Arc::new(SqliteLedger::open(&path).unwrap()), chain);
        let stored = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert!(stored.credential_ref.is_none());
        assert_eq!(h.ledger.pending_provisioning().await.unwrap().len(), 1);

        assert_eq!(h.engine.retry_provisioning().await.unwrap(), 1);
        assert_eq!(h.engine.retry_provisioning().await.unwrap(), 0);
        assert_eq!(h.provisioner.calls(), 1);

        let stored = h.engine.get_attempt_by_id(&attempt.id).await.unwrap();
        assert_eq!(stored.credential_ref, Some(format!("cred-{}", attempt.id)));
    }
}
