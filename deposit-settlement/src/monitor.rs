// Copyright (c) 2024 Botho Foundation

//! Fixed-interval driver for deposit detection.
//!
//! Each tick scans every open attempt, records what it finds, expires stale
//! attempts, then retries outstanding provisioning and sweeps. A tick that
//! fires while the previous one is still running is skipped.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    chain::{CandidateTransfer, ChainScanner},
    config::SettlementConfig,
    engine::SettlementEngine,
    error::SettlementResult,
    ledger::RecordOutcome,
    model::{DepositMethod, PaymentAttempt},
};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Open attempts scanned
    pub attempts_checked: usize,
    /// Attempts whose scan or recording failed
    pub attempts_failed: usize,
    /// New transfers credited
    pub transfers_recorded: usize,
    /// Attempts moved to EXPIRED
    pub expired: usize,
    /// Credentials issued by the trailing provisioning pass
    pub provisioned: usize,
    /// Sweeps sent by the trailing sweep pass
    pub swept: usize,
}

/// Scanner settings used by the monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub memo_address: String,
    pub dust_threshold: u64,
    pub max_signatures: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            memo_address: config.memo_address().to_string(),
            dust_threshold: config.dust_threshold,
            max_signatures: config.max_signatures,
        }
    }
}

/// Clears the running flag when a tick ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Polls the chain for payments to open attempts.
pub struct Monitor {
    engine: Arc<SettlementEngine>,
    scanner: ChainScanner,
    settings: MonitorSettings,
    running: AtomicBool,
}

impl Monitor {
    pub fn new(
        engine: Arc<SettlementEngine>,
        scanner: ChainScanner,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            engine,
            scanner,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Run one tick.
    ///
    /// Returns `None` without doing anything if another tick is in
    /// progress.
    pub async fn tick(&self) -> Option<TickSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous monitor tick still running, skipping");
            return None;
        }
        let _guard = TickGuard(&self.running);

        Some(self.run_tick().await)
    }

    async fn run_tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        match self.engine.get_pending_attempts().await {
            Ok(attempts) => {
                for attempt in &attempts {
                    summary.attempts_checked += 1;
                    match self.process_attempt(attempt).await {
                        Ok(recorded) => summary.transfers_recorded += recorded,
                        Err(e) if e.is_transient() => {
                            summary.attempts_failed += 1;
                            warn!(
                                "Failed to process attempt {}, retrying next tick: {}",
                                attempt.id, e
                            );
                        }
                        Err(e) => {
                            summary.attempts_failed += 1;
                            error!("Failed to process attempt {}: {}", attempt.id, e);
                        }
                    }
                }
            }
            Err(e) => error!("Failed to load pending attempts: {}", e),
        }

        match self.engine.mark_expired().await {
            Ok(n) => summary.expired = n,
            Err(e) => error!("Failed to expire stale attempts: {}", e),
        }

        match self.engine.retry_provisioning().await {
            Ok(n) => summary.provisioned = n,
            Err(e) => error!("Provisioning pass failed: {}", e),
        }

        match self.engine.sweeper().sweep_completed().await {
            Ok(n) => summary.swept = n,
            Err(e) => error!("Sweep pass failed: {}", e),
        }

        if summary.transfers_recorded > 0
            || summary.expired > 0
            || summary.provisioned > 0
            || summary.swept > 0
        {
            info!(
                "Tick: checked {} attempts, recorded {} transfers, expired {}, provisioned {}, swept {}",
                summary.attempts_checked,
                summary.transfers_recorded,
                summary.expired,
                summary.provisioned,
                summary.swept
            );
        }
        summary
    }

    /// Scan for one attempt and record every candidate. Returns how many
    /// were new.
    async fn process_attempt(&self, attempt: &PaymentAttempt) -> SettlementResult<usize> {
        let candidates = self.detect(attempt).await?;

        let mut recorded = 0;
        for candidate in candidates {
            let outcome = self
                .engine
                .record_transaction(
                    &attempt.id,
                    &candidate.signature,
                    candidate.amount,
                    &candidate.sender,
                    candidate.confirmations,
                )
                .await?;
            if !matches!(outcome, RecordOutcome::Duplicate) {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    async fn detect(&self, attempt: &PaymentAttempt) -> SettlementResult<Vec<CandidateTransfer>> {
        match &attempt.deposit {
            DepositMethod::Address(address) => {
                self.scanner
                    .scan(address, self.settings.dust_threshold, self.settings.max_signatures)
                    .await
            }
            DepositMethod::Memo(memo) => {
                self.scanner
                    .scan_memo(
                        &self.settings.memo_address,
                        memo,
                        attempt.remaining(),
                        self.settings.max_signatures,
                        attempt.created_at,
                    )
                    .await
            }
        }
    }

    /// Tick every interval until `shutdown` is set.
    ///
    /// Ticks run on their own task so a slow tick doesn't delay the timer;
    /// a tick is not started while the previous one is still running. The
    /// last tick is awaited before returning.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        info!(
            "Monitor started, polling every {}s",
            self.settings.interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown_check = tokio::time::interval(Duration::from_millis(250));
        let mut in_flight: Option<JoinHandle<Option<TickSummary>>> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        debug!("Previous monitor tick still running, skipping");
                        continue;
                    }
                    let monitor = self.clone();
                    in_flight = Some(tokio::spawn(async move { monitor.tick().await }));
                }
                _ = shutdown_check.tick() => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                error!("Monitor tick task failed: {}", e);
            }
        }
        info!("Monitor stopped");
    }
}
