// Copyright (c) 2024 Botho Foundation

//! Pricing and capacity collaborators.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    config::TierConfig,
    error::{SettlementError, SettlementResult},
};

/// Quotes the price of a purchase.
pub trait PriceOracle: Send + Sync {
    /// Price in base units for `duration_units` of `tier`.
    fn quote(&self, tier: &str, duration_units: u32) -> SettlementResult<u64>;
}

/// Reports how much capacity is committed.
#[async_trait]
pub trait CapacityGauge: Send + Sync {
    /// Units currently allocated to active purchases.
    async fn used(&self) -> SettlementResult<u64>;

    /// Units available in total.
    fn total(&self) -> u64;
}

/// Price = `price_per_unit * duration_units`.
#[derive(Debug, Clone)]
pub struct LinearPricing {
    prices: HashMap<String, u64>,
}

impl LinearPricing {
    pub fn new(tiers: &[TierConfig]) -> Self {
        Self {
            prices: tiers
                .iter()
                .map(|t| (t.name.clone(), t.price_per_unit))
                .collect(),
        }
    }
}

impl PriceOracle for LinearPricing {
    fn quote(&self, tier: &str, duration_units: u32) -> SettlementResult<u64> {
        let per_unit = self
            .prices
            .get(tier)
            .ok_or_else(|| SettlementError::Validation(format!("unknown tier: {}", tier)))?;

        per_unit
            .checked_mul(duration_units as u64)
            .ok_or_else(|| SettlementError::Validation("price overflows".to_string()))
    }
}

/// Fixed total with a fixed amount already in use.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapacity {
    total: u64,
    used: u64,
}

impl StaticCapacity {
    pub fn new(total: u64) -> Self {
        Self { total, used: 0 }
    }

    pub fn with_used(total: u64, used: u64) -> Self {
        Self { total, used }
    }
}

#[async_trait]
impl CapacityGauge for StaticCapacity {
    async fn used(&self) -> SettlementResult<u64> {
        Ok(self.used)
    }

    fn total(&self) -> u64 {
        self.total
    }
}
