// Copyright (c) 2024 Botho Foundation

//! Configuration for the settlement engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::issuer::decode_address;

/// Environment variable consulted when `vault_key` is absent from the file.
pub const VAULT_KEY_ENV: &str = "SETTLEMENT_VAULT_KEY";

/// Longest allowed payment window (one week).
pub const MAX_EXPIRY_MINUTES: u64 = 7 * 24 * 60;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Missing secrets are fatal
    #[default]
    Production,
    /// Throwaway secrets are allowed
    Development,
}

/// A purchasable service tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    /// Tier name used by purchase requests
    pub name: String,

    /// Capacity units the tier allocates while active
    pub allocation: u64,

    /// Price per duration unit, in base units
    pub price_per_unit: u64,
}

/// Settlement engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Chain JSON-RPC endpoint
    #[serde(default = "default_rpc_endpoint")]
    pub rpc_endpoint: String,

    /// Treasury address receiving swept funds (base58)
    pub treasury_address: String,

    /// Shared address for legacy memo payments (defaults to the treasury)
    pub memo_address: Option<String>,

    /// Vault key (64-character hex string, 32 bytes)
    pub vault_key: Option<String>,

    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Monitor tick interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minutes before an unpaid attempt expires
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,

    /// Fraction of the requested minimum a transfer must reach, in basis
    /// points (9900 = 99%)
    #[serde(default = "default_tolerance_bps")]
    pub tolerance_bps: u64,

    /// Smallest transfer credited to an address-based attempt, in base units
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: u64,

    /// Signatures fetched per history page
    #[serde(default = "default_max_signatures")]
    pub max_signatures: usize,

    /// Most history pages walked per memo attempt per tick
    #[serde(default = "default_memo_scan_pages")]
    pub memo_scan_pages: usize,

    /// Delay between consecutive RPC requests in milliseconds
    #[serde(default = "default_rpc_delay_ms")]
    pub rpc_delay_ms: u64,

    /// RPC request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// SQLite ledger database file
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Longest purchasable duration, in units
    #[serde(default = "default_max_duration_units")]
    pub max_duration_units: u32,

    /// Total capacity units available for allocation
    #[serde(default = "default_capacity_total")]
    pub capacity_total: u64,

    /// Purchasable tiers
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Provisioning service URL; credentials are issued locally if unset
    pub provisioning_url: Option<String>,

    /// Notification webhook URL; notifications go to stdout if unset
    pub webhook_url: Option<String>,
}

fn default_rpc_endpoint() -> String {
    "http://localhost:8899".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_expiry_minutes() -> u64 {
    30
}

fn default_tolerance_bps() -> u64 {
    9_900
}

fn default_dust_threshold() -> u64 {
    1_000
}

fn default_max_signatures() -> usize {
    20
}

fn default_memo_scan_pages() -> usize {
    10
}

fn default_rpc_delay_ms() -> u64 {
    200
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("settlement.db")
}

fn default_max_duration_units() -> u32 {
    12
}

fn default_capacity_total() -> u64 {
    1_000
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: default_rpc_endpoint(),
            treasury_address: String::new(),
            memo_address: None,
            vault_key: None,
            environment: Environment::default(),
            poll_interval_secs: default_poll_interval(),
            expiry_minutes: default_expiry_minutes(),
            tolerance_bps: default_tolerance_bps(),
            dust_threshold: default_dust_threshold(),
            max_signatures: default_max_signatures(),
            memo_scan_pages: default_memo_scan_pages(),
            rpc_delay_ms: default_rpc_delay_ms(),
            rpc_timeout_secs: default_rpc_timeout(),
            ledger_path: default_ledger_path(),
            max_duration_units: default_max_duration_units(),
            capacity_total: default_capacity_total(),
            tiers: Vec::new(),
            provisioning_url: None,
            webhook_url: None,
        }
    }
}

impl SettlementConfig {
    /// Load configuration from a TOML file.
    ///
    /// `vault_key` falls back to the `SETTLEMENT_VAULT_KEY` environment
    /// variable.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: SettlementConfig = toml::from_str(&content)?;
        if config.vault_key.is_none() {
            config.vault_key = std::env::var(VAULT_KEY_ENV).ok().filter(|k| !k.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        decode_address(&self.treasury_address)
            .map_err(|e| anyhow::anyhow!("treasury_address: {}", e))?;
        if let Some(memo) = &self.memo_address {
            decode_address(memo).map_err(|e| anyhow::anyhow!("memo_address: {}", e))?;
        }

        match &self.vault_key {
            Some(key) => {
                if key.len() != 64 {
                    anyhow::bail!(
                        "vault_key must be 64 hex characters (32 bytes), got {}",
                        key.len()
                    );
                }
                hex::decode(key)
                    .map_err(|e| anyhow::anyhow!("vault_key is not valid hex: {}", e))?;
            }
            None if self.environment == Environment::Production => {
                anyhow::bail!(
                    "vault_key (or {}) is required when environment = production",
                    VAULT_KEY_ENV
                );
            }
            None => {}
        }

        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be > 0");
        }
        if self.expiry_minutes == 0 || self.expiry_minutes > MAX_EXPIRY_MINUTES {
            anyhow::bail!("expiry_minutes must be in 1..={}", MAX_EXPIRY_MINUTES);
        }
        if self.tolerance_bps == 0 || self.tolerance_bps > 10_000 {
            anyhow::bail!("tolerance_bps must be in 1..=10000");
        }
        if self.max_signatures == 0 {
            anyhow::bail!("max_signatures must be > 0");
        }
        if self.memo_scan_pages == 0 {
            anyhow::bail!("memo_scan_pages must be > 0");
        }
        if self.max_duration_units == 0 {
            anyhow::bail!("max_duration_units must be > 0");
        }

        if self.tiers.is_empty() {
            anyhow::bail!("At least one tier must be configured");
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.name.trim().is_empty() {
                anyhow::bail!("tier #{} has an empty name", i);
            }
            if tier.price_per_unit == 0 {
                anyhow::bail!("tier {} must have a non-zero price_per_unit", tier.name);
            }
            if self.tiers[..i].iter().any(|t| t.name == tier.name) {
                anyhow::bail!("duplicate tier name: {}", tier.name);
            }
            if tier.allocation > self.capacity_total {
                tracing::warn!(
                    "Tier {} allocates {} units but total capacity is {}; it can never be sold",
                    tier.name,
                    tier.allocation,
                    self.capacity_total
                );
            }
        }

        Ok(())
    }

    /// Look up a tier by name.
    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Address monitored for legacy memo payments.
    pub fn memo_address(&self) -> &str {
        self.memo_address.as_deref().unwrap_or(&self.treasury_address)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rpc_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rpc_delay_ms)
    }

    /// Payment window, clamped to [`MAX_EXPIRY_MINUTES`].
    pub fn expiry_window(&self) -> chrono::Duration {
        let minutes = i64::try_from(self.expiry_minutes.min(MAX_EXPIRY_MINUTES))
            .unwrap_or(MAX_EXPIRY_MINUTES as i64);
        chrono::Duration::minutes(minutes)
    }
}
