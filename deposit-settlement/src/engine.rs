// Copyright (c) 2024 Botho Foundation

//! Settlement state machine.
//!
//! The engine is the only writer of attempt status and `amount_paid`. It
//! hands each detected transfer to [`Ledger::record_transfer`], which
//! applies the credit and status transition atomically, and fires the
//! completion effects (provisioning, events, sweep) only for the single
//! call whose transfer moved the attempt into COMPLETED. Re-delivered or
//! concurrently delivered transfers therefore cannot trigger them twice.
//!
//! The issued credential is stored on the attempt. A completed attempt
//! without one is picked up again by [`SettlementEngine::retry_provisioning`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    claim::ClaimSet,
    config::{SettlementConfig, TierConfig},
    error::{SettlementError, SettlementResult},
    events::{EventBus, SettlementEvent},
    issuer::AddressIssuer,
    ledger::{Ledger, RecordOutcome},
    model::{
        format_amount, AttemptId, AttemptStatus, DepositMethod, NewTransfer, PaymentAttempt,
        Transaction,
    },
    pricing::{CapacityGauge, LinearPricing, PriceOracle, StaticCapacity},
    provision::{NoopProvisioner, Provisioner},
    sweeper::Sweeper,
    vault::KeyVault,
};

/// Static settings the engine validates requests against.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tiers: Vec<TierConfig>,
    pub expiry_window: Duration,
    pub max_duration_units: u32,
    pub capacity_total: u64,
}

impl EngineSettings {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            tiers: config.tiers.clone(),
            expiry_window: config.expiry_window(),
            max_duration_units: config.max_duration_units,
            capacity_total: config.capacity_total,
        }
    }
}

/// Records payments and drives attempts through their lifecycle.
pub struct SettlementEngine {
    settings: EngineSettings,
    ledger: Arc<dyn Ledger>,
    issuer: AddressIssuer,
    vault: Arc<KeyVault>,
    sweeper: Arc<Sweeper>,
    bus: EventBus,
    pricing: Arc<dyn PriceOracle>,
    capacity: Arc<dyn CapacityGauge>,
    provisioner: Arc<dyn Provisioner>,
    provisioning: ClaimSet,
}

impl SettlementEngine {
    /// Create an engine with linear pricing, static capacity and local
    /// credentials. Use the `with_*` methods to swap collaborators.
    pub fn new(
        settings: EngineSettings,
        ledger: Arc<dyn Ledger>,
        vault: Arc<KeyVault>,
        sweeper: Arc<Sweeper>,
        bus: EventBus,
    ) -> Self {
        let pricing = Arc::new(LinearPricing::new(&settings.tiers));
        let capacity = Arc::new(StaticCapacity::new(settings.capacity_total));
        Self {
            settings,
            ledger,
            issuer: AddressIssuer::new(),
            vault,
            sweeper,
            bus,
            pricing,
            capacity,
            provisioner: Arc::new(NoopProvisioner),
            provisioning: ClaimSet::new(),
        }
    }

    pub fn with_pricing(mut self, pricing: Arc<dyn PriceOracle>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_capacity(mut self, capacity: Arc<dyn CapacityGauge>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// Open a new attempt with a fresh deposit address.
    pub async fn create_attempt(
        &self,
        owner_id: &str,
        tier: &str,
        duration_units: u32,
    ) -> SettlementResult<PaymentAttempt> {
        let amount_expected = self.price_and_reserve(owner_id, tier, duration_units).await?;

        let issued = self.issuer.issue();
        let sealed = self.vault.encrypt(&issued.secret[..])?;
        drop(issued.secret);

        let attempt = self.new_attempt(
            owner_id,
            tier,
            duration_units,
            amount_expected,
            DepositMethod::Address(issued.address),
            Some(sealed),
        );
        self.ledger.insert_attempt(attempt.clone()).await?;

        info!(
            "Created attempt {} for {}: {} x{} = {} to {}",
            attempt.id,
            owner_id,
            tier,
            duration_units,
            format_amount(amount_expected),
            attempt.deposit_address().unwrap_or_default()
        );
        Ok(attempt)
    }

    /// Open a legacy attempt paid by memo into the shared memo address.
    pub async fn create_memo_attempt(
        &self,
        owner_id: &str,
        tier: &str,
        duration_units: u32,
        memo: &str,
    ) -> SettlementResult<PaymentAttempt> {
        let memo = memo.trim();
        if memo.is_empty() {
            return Err(SettlementError::Validation("memo must not be empty".to_string()));
        }
        let amount_expected = self.price_and_reserve(owner_id, tier, duration_units).await?;

        let attempt = self.new_attempt(
            owner_id,
            tier,
            duration_units,
            amount_expected,
            DepositMethod::Memo(memo.to_string()),
            None,
        );
        self.ledger.insert_attempt(attempt.clone()).await?;

        info!(
            "Created memo attempt {} for {} with memo {:?}",
            attempt.id, owner_id, memo
        );
        Ok(attempt)
    }

    /// Validate the request and quote it.
    async fn price_and_reserve(
        &self,
        owner_id: &str,
        tier: &str,
        duration_units: u32,
    ) -> SettlementResult<u64> {
        if owner_id.trim().is_empty() {
            return Err(SettlementError::Validation("owner id must not be empty".to_string()));
        }
        let tier_config = self
            .settings
            .tiers
            .iter()
            .find(|t| t.name == tier)
            .ok_or_else(|| SettlementError::Validation(format!("unknown tier: {}", tier)))?;
        if duration_units == 0 || duration_units > self.settings.max_duration_units {
            return Err(SettlementError::Validation(format!(
                "duration must be between 1 and {}, got {}",
                self.settings.max_duration_units, duration_units
            )));
        }

        let used = self.capacity.used().await?;
        let available = self.capacity.total().saturating_sub(used);
        if tier_config.allocation > available {
            return Err(SettlementError::Capacity {
                requested: tier_config.allocation,
                available,
            });
        }

        let amount = self.pricing.quote(tier, duration_units)?;
        if amount == 0 {
            return Err(SettlementError::Validation(format!(
                "tier {} quoted a zero price",
                tier
            )));
        }
        Ok(amount)
    }

    fn new_attempt(
        &self,
        owner_id: &str,
        tier: &str,
        duration_units: u32,
        amount_expected: u64,
        deposit: DepositMethod,
        encrypted_private_key: Option<Vec<u8>>,
    ) -> PaymentAttempt {
        let now = Utc::now();
        PaymentAttempt {
            id: AttemptId::generate(),
            owner_id: owner_id.to_string(),
            tier: tier.to_string(),
            duration_units,
            amount_expected,
            amount_paid: 0,
            status: AttemptStatus::Pending,
            deposit,
            encrypted_private_key,
            credential_ref: None,
            expires_at: now + self.settings.expiry_window,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn get_attempt_by_id(&self, id: &AttemptId) -> SettlementResult<PaymentAttempt> {
        self.ledger
            .get_attempt(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(id.clone()))
    }

    pub async fn get_attempt_by_address(
        &self,
        address: &str,
    ) -> SettlementResult<Option<PaymentAttempt>> {
        self.ledger.get_attempt_by_address(address).await
    }

    /// Attempts still awaiting payment (PENDING or PARTIAL).
    pub async fn get_pending_attempts(&self) -> SettlementResult<Vec<PaymentAttempt>> {
        self.ledger.pending_attempts().await
    }

    pub async fn transactions_for(&self, id: &AttemptId) -> SettlementResult<Vec<Transaction>> {
        self.get_attempt_by_id(id).await?;
        self.ledger.transactions_for(id).await
    }

    /// Credit a chain transfer to an attempt.
    ///
    /// Recording a signature that is already known is a no-op returning
    /// [`RecordOutcome::Duplicate`].
    pub async fn record_transaction(
        &self,
        attempt_id: &AttemptId,
        signature: &str,
        amount: u64,
        sender: &str,
        confirmations: u64,
    ) -> SettlementResult<RecordOutcome> {
        if signature.is_empty() {
            return Err(SettlementError::Validation("signature must not be empty".to_string()));
        }
        if amount == 0 {
            return Err(SettlementError::Validation(format!(
                "transfer {} has a zero amount",
                signature
            )));
        }

        let outcome = self
            .ledger
            .record_transfer(
                NewTransfer {
                    attempt_id: attempt_id.clone(),
                    signature: signature.to_string(),
                    amount,
                    sender: sender.to_string(),
                    confirmations,
                },
                Utc::now(),
            )
            .await?;

        let RecordOutcome::Credited {
            attempt,
            previous_status,
        } = &outcome
        else {
            debug!("Transfer {} already recorded", signature);
            return Ok(outcome);
        };

        if outcome.completed_now() {
            info!(
                "Attempt {} completed: paid {} of {}",
                attempt.id,
                format_amount(attempt.amount_paid),
                format_amount(attempt.amount_expected)
            );
            self.complete(attempt).await;
        } else if previous_status.is_terminal() {
            warn!(
                "Transfer {} of {} credited to {} attempt {}",
                signature,
                format_amount(amount),
                previous_status,
                attempt.id
            );
        } else if attempt.status == AttemptStatus::Partial {
            info!(
                "Attempt {} partially paid: {} of {}",
                attempt.id,
                format_amount(attempt.amount_paid),
                format_amount(attempt.amount_expected)
            );
            self.bus.publish(SettlementEvent::PaymentReceived {
                attempt_id: attempt.id.clone(),
                owner_id: attempt.owner_id.clone(),
                signature: signature.to_string(),
                amount,
                amount_paid: attempt.amount_paid,
                remaining: attempt.remaining(),
            });
        }

        Ok(outcome)
    }

    /// Completion effects. Failures are logged; settlement stands.
    async fn complete(&self, attempt: &PaymentAttempt) {
        self.bus.publish(SettlementEvent::AttemptCompleted {
            attempt_id: attempt.id.clone(),
            owner_id: attempt.owner_id.clone(),
            tier: attempt.tier.clone(),
            duration_units: attempt.duration_units,
            amount_paid: attempt.amount_paid,
        });

        if let Err(e) = self.provision(&attempt.id).await {
            error!(
                "Provisioning failed for attempt {}, will retry: {}",
                attempt.id, e
            );
        }

        if attempt.deposit_address().is_some() {
            if let Err(e) = self.sweeper.sweep(&attempt.id).await {
                warn!("Post-completion sweep of attempt {} failed: {}", attempt.id, e);
            }
        }
    }

    /// Issue and store a credential for a completed attempt that has none.
    ///
    /// Returns whether a credential was issued by this call.
    async fn provision(&self, id: &AttemptId) -> SettlementResult<bool> {
        let Some(_claim) = self.provisioning.claim(id) else {
            debug!("Provisioning already in progress for attempt {}", id);
            return Ok(false);
        };
        let attempt = self.get_attempt_by_id(id).await?;
        if !attempt.needs_provisioning() {
            return Ok(false);
        }

        let credential = self.provisioner.provision(&attempt).await?;
        self.ledger
            .set_credential(id, &credential.credential_ref)
            .await?;

        info!("Issued credential for attempt {}", id);
        self.bus.publish(SettlementEvent::CredentialIssued {
            attempt_id: attempt.id,
            owner_id: attempt.owner_id,
            credential_ref: credential.credential_ref,
        });
        Ok(true)
    }

    /// Provision completed attempts whose credential was never stored.
    ///
    /// Returns how many credentials were issued. Per-attempt failures are
    /// logged and left for the next call.
    pub async fn retry_provisioning(&self) -> SettlementResult<usize> {
        let mut issued = 0;
        for attempt in self.ledger.pending_provisioning().await? {
            match self.provision(&attempt.id).await {
                Ok(true) => issued += 1,
                Ok(false) => {}
                Err(e) => warn!("Provisioning retry for attempt {} failed: {}", attempt.id, e),
            }
        }
        Ok(issued)
    }

    /// Expire unpaid attempts whose deadline has passed.
    pub async fn mark_expired(&self) -> SettlementResult<usize> {
        self.mark_expired_at(Utc::now()).await
    }

    /// [`mark_expired`](Self::mark_expired) against an explicit clock.
    pub async fn mark_expired_at(&self, now: DateTime<Utc>) -> SettlementResult<usize> {
        let expired = self.ledger.expire_stale(now).await?;
        if !expired.is_empty() {
            info!("Expired {} attempts", expired.len());
            self.bus.publish(SettlementEvent::AttemptsExpired {
                attempt_ids: expired.clone(),
            });
        }
        Ok(expired.len())
    }

    /// Manually sweep an attempt's deposit address.
    ///
    /// Refused with [`SettlementError::Validation`] until the attempt is
    /// COMPLETED or EXPIRED.
    pub async fn sweep(&self, id: &AttemptId) -> SettlementResult<Option<String>> {
        self.sweeper.sweep(id).await
    }
}
