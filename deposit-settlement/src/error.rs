// Copyright (c) 2024 Botho Foundation

//! Error types for the settlement engine.

use displaydoc::Display;
use thiserror::Error;

use crate::model::AttemptId;

/// Errors surfaced by settlement, custody and chain operations.
#[derive(Debug, Display, Error)]
pub enum SettlementError {
    /// Invalid request: {0}
    Validation(String),

    /// Insufficient capacity: requested {requested}, available {available}
    Capacity { requested: u64, available: u64 },

    /// Payment attempt not found: {0}
    NotFound(AttemptId),

    /// Chain RPC error: {0}
    Chain(String),

    /// Key custody failure: {0}
    Crypto(String),

    /// Sweep failed: {0}
    SweepFailed(String),

    /// Provisioning failed: {0}
    Provisioning(String),

    /// Ledger error: {0}
    Ledger(String),

    /// Configuration error: {0}
    Config(String),
}

impl SettlementError {
    /// Whether the failure is worth retrying on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlementError::Chain(_)
                | SettlementError::SweepFailed(_)
                | SettlementError::Provisioning(_)
        )
    }
}

impl From<reqwest::Error> for SettlementError {
    fn from(err: reqwest::Error) -> Self {
        SettlementError::Chain(err.to_string())
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(err: serde_json::Error) -> Self {
        SettlementError::Ledger(err.to_string())
    }
}

impl From<rusqlite::Error> for SettlementError {
    fn from(err: rusqlite::Error) -> Self {
        SettlementError::Ledger(err.to_string())
    }
}

impl From<std::io::Error> for SettlementError {
    fn from(err: std::io::Error) -> Self {
        SettlementError::Ledger(err.to_string())
    }
}

/// Result type for settlement operations.
pub type SettlementResult<T> = Result<T, SettlementError>;
