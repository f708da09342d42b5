// Copyright (c) 2024 Botho Foundation

//! Payment attempt and transaction records.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};

/// Decimal places of the native asset.
pub const AMOUNT_DECIMALS: u32 = 9;

/// Base units per whole coin.
pub const BASE_UNITS_PER_COIN: u64 = 1_000_000_000;

/// Opaque payment attempt identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    /// Generate a fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AttemptId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AttemptId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settlement status of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Partial,
    Completed,
    Expired,
}

impl AttemptStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::Expired)
    }

    /// Whether `next` is a legal forward move from `self`.
    ///
    /// PENDING -> PARTIAL -> COMPLETED, and any non-terminal status may
    /// expire. Staying in PARTIAL while more partial payments arrive is
    /// allowed.
    pub fn can_advance_to(self, next: AttemptStatus) -> bool {
        use AttemptStatus::*;
        match (self, next) {
            (Pending, Partial) | (Pending, Completed) | (Pending, Expired) => true,
            (Partial, Partial) | (Partial, Completed) | (Partial, Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptStatus::Pending => "PENDING",
            AttemptStatus::Partial => "PARTIAL",
            AttemptStatus::Completed => "COMPLETED",
            AttemptStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

impl FromStr for AttemptStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> SettlementResult<Self> {
        match s {
            "PENDING" => Ok(AttemptStatus::Pending),
            "PARTIAL" => Ok(AttemptStatus::Partial),
            "COMPLETED" => Ok(AttemptStatus::Completed),
            "EXPIRED" => Ok(AttemptStatus::Expired),
            other => Err(SettlementError::Ledger(format!(
                "unknown attempt status: {}",
                other
            ))),
        }
    }
}

/// How payments for an attempt are detected on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DepositMethod {
    /// Single-use deposit address owned by this attempt.
    Address(String),
    /// Legacy memo tag on a transfer into the shared memo address.
    Memo(String),
}

/// A purchase awaiting (or having received) on-chain payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: AttemptId,
    pub owner_id: String,
    pub tier: String,
    pub duration_units: u32,
    /// Base units required to complete the purchase
    pub amount_expected: u64,
    /// Base units credited so far (never decreases)
    pub amount_paid: u64,
    pub status: AttemptStatus,
    pub deposit: DepositMethod,
    /// Vault-sealed deposit key, cleared once swept
    #[serde(default, with = "hex_opt")]
    pub encrypted_private_key: Option<Vec<u8>>,
    /// Credential issued on completion; `None` until provisioning succeeds
    #[serde(default)]
    pub credential_ref: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    /// The deposit address, if this attempt uses one.
    pub fn deposit_address(&self) -> Option<&str> {
        match &self.deposit {
            DepositMethod::Address(addr) => Some(addr),
            DepositMethod::Memo(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Base units still owed.
    pub fn remaining(&self) -> u64 {
        self.amount_expected.saturating_sub(self.amount_paid)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Paid in full but no credential recorded yet.
    pub fn needs_provisioning(&self) -> bool {
        self.status == AttemptStatus::Completed && self.credential_ref.is_none()
    }
}

/// A chain transfer credited to a payment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub payment_attempt_id: AttemptId,
    /// Chain transaction signature; globally unique
    pub signature: String,
    pub amount: u64,
    pub sender_address: String,
    pub confirmations: u64,
    pub verified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A transfer to be credited, as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub attempt_id: AttemptId,
    pub signature: String,
    pub amount: u64,
    pub sender: String,
    pub confirmations: u64,
}

/// Format base units as a decimal string (e.g. `0.400000000`).
pub fn format_amount(base_units: u64) -> String {
    format!(
        "{}.{:09}",
        base_units / BASE_UNITS_PER_COIN,
        base_units % BASE_UNITS_PER_COIN
    )
}

/// Parse a decimal string into base units.
pub fn parse_amount(s: &str) -> SettlementResult<u64> {
    let s = s.trim();
    let invalid = || SettlementError::Validation(format!("invalid amount: {:?}", s));

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if !digits(whole) || !digits(frac) {
        return Err(invalid());
    }
    if frac.len() > AMOUNT_DECIMALS as usize {
        return Err(SettlementError::Validation(format!(
            "amount {:?} has more than {} decimal places",
            s, AMOUNT_DECIMALS
        )));
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let frac_units: u64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = AMOUNT_DECIMALS as usize);
        padded.parse().map_err(|_| invalid())?
    };

    whole
        .checked_mul(BASE_UNITS_PER_COIN)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| SettlementError::Validation(format!("amount {:?} overflows", s)))
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(d)?;
        value
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_only() {
        use AttemptStatus::*;
        assert!(Pending.can_advance_to(Partial));
        assert!(Pending.can_advance_to(Completed));
        assert!(Partial.can_advance_to(Partial));
        assert!(Partial.can_advance_to(Expired));

        assert!(!Completed.can_advance_to(Expired));
        assert!(!Completed.can_advance_to(Pending));
        assert!(!Expired.can_advance_to(Pending));
        assert!(!Expired.can_advance_to(Partial));
        assert!(!Partial.can_advance_to(Pending));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(400_000_000), "0.400000000");
        assert_eq!(format_amount(1_000_000_000), "1.000000000");
        assert_eq!(format_amount(0), "0.000000000");
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1").unwrap(), BASE_UNITS_PER_COIN);
        assert_eq!(parse_amount("0.4").unwrap(), 400_000_000);
        assert_eq!(parse_amount("0.600000").unwrap(), 600_000_000);
        assert_eq!(parse_amount(".5").unwrap(), 500_000_000);
        assert!(parse_amount("").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("0.0000000001").is_err());
        assert!(parse_amount("99999999999999").is_err());
        assert!(parse_amount("1.+5").is_err());
        assert!(parse_amount("+1").is_err());
        assert!(parse_amount("1.-5").is_err());
        assert!(parse_amount("1 .5").is_err());
    }

    #[test]
    fn test_attempt_serde_keeps_sealed_key() {
        let now = Utc::now();
        let attempt = PaymentAttempt {
            id: AttemptId::from("a1"),
            owner_id: "owner".into(),
            tier: "basic".into(),
            duration_units: 1,
            amount_expected: 10,
            amount_paid: 0,
            status: AttemptStatus::Pending,
            deposit: DepositMethod::Address("addr".into()),
            encrypted_private_key: Some(vec![1, 2, 3]),
            credential_ref: None,
            expires_at: now,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_string(&attempt).unwrap();
        assert!(json.contains("\"010203\""));
        assert!(json.contains("\"PENDING\""));

        let back: PaymentAttempt = serde_json::from_str(&json).unwrap();
        assert_eq!(back.encrypted_private_key, Some(vec![1, 2, 3]));
        assert_eq!(back.deposit_address(), Some("addr"));
    }

    #[test]
    fn test_status_parses_its_display_form() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::Partial,
            AttemptStatus::Completed,
            AttemptStatus::Expired,
        ] {
            assert_eq!(status.to_string().parse::<AttemptStatus>().unwrap(), status);
        }
        assert!("pending".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn test_generated_ids_are_uuids() {
        let id = AttemptId::generate();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(id, AttemptId::generate());
    }
}
