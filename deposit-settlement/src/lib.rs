// Copyright (c) 2024 Botho Foundation

//! Deposit Settlement
//!
//! An on-chain payment settlement engine for subscription purchases. This
//! library provides:
//!
//! - Single-use deposit addresses with encrypted key custody
//! - Chain scanning for deposits by address or legacy memo
//! - An idempotent settlement state machine (PENDING, PARTIAL, COMPLETED,
//!   EXPIRED) that fires completion effects exactly once
//! - A non-reentrant polling monitor
//! - Sweeping of deposit balances into a treasury address
//!
//! # Architecture
//!
//! The [`Monitor`] ticks at a fixed interval, loads every open attempt from
//! the [`Ledger`], asks the [`ChainScanner`] for matching transfers and
//! hands them to the [`SettlementEngine`]. The engine records each transfer
//! atomically; the transfer that completes an attempt triggers provisioning
//! and a [`Sweeper`] run. Notifications are published as
//! [`SettlementEvent`]s on an [`EventBus`] and delivered by subscribers.
//!
//! # Security Model
//!
//! Deposit private keys exist in plaintext only transiently: at issuance,
//! before they are sealed by the [`KeyVault`], and inside a sweep, before
//! the transfer is signed. The sealed key is deleted once the sweep
//! transfer has been accepted.

pub mod chain;
pub mod claim;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod issuer;
pub mod ledger;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod pricing;
pub mod provision;
pub mod sweeper;
pub mod vault;

pub use chain::{CandidateTransfer, ChainClient, ChainScanner, RpcChainClient};
pub use config::SettlementConfig;
pub use engine::{EngineSettings, SettlementEngine};
pub use error::{SettlementError, SettlementResult};
pub use events::{EventBus, SettlementEvent};
pub use ledger::{Ledger, RecordOutcome, SqliteLedger};
pub use model::{AttemptId, AttemptStatus, DepositMethod, PaymentAttempt, Transaction};
pub use monitor::{Monitor, MonitorSettings, TickSummary};
pub use sweeper::Sweeper;
pub use vault::KeyVault;
