// Copyright (c) 2024 Botho Foundation

//! Credential provisioning for completed purchases.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{SettlementError, SettlementResult},
    http::{post_json, Backoff},
    model::PaymentAttempt,
};

/// What a provisioner hands back for a completed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque reference to the issued credential
    pub credential_ref: String,
}

/// Issues a service credential once an attempt is fully paid.
///
/// Called right after an attempt transitions to COMPLETED, and again from
/// the monitor for completed attempts that still have no credential.
/// Implementations should key on the attempt id.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, attempt: &PaymentAttempt) -> SettlementResult<Credential>;
}

/// Issues a random local credential reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(&self, attempt: &PaymentAttempt) -> SettlementResult<Credential> {
        tracing::debug!("Issued local credential for attempt {}", attempt.id);
        Ok(Credential {
            credential_ref: format!("local-{}", Uuid::new_v4()),
        })
    }
}

#[derive(Debug, Serialize)]
struct ProvisionRequest<'a> {
    attempt_id: &'a str,
    owner_id: &'a str,
    tier: &'a str,
    duration_units: u32,
    amount_paid: u64,
}

/// Asks a provisioning service over HTTP.
pub struct HttpProvisioner {
    client: Client,
    url: String,
    backoff: Backoff,
}

impl HttpProvisioner {
    pub fn new(url: &str, timeout: Duration) -> SettlementResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Config(format!("provisioning client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            backoff: Backoff::linear(2, Duration::from_millis(500)),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self, attempt: &PaymentAttempt) -> SettlementResult<Credential> {
        let request = ProvisionRequest {
            attempt_id: attempt.id.as_str(),
            owner_id: &attempt.owner_id,
            tier: &attempt.tier,
            duration_units: attempt.duration_units,
            amount_paid: attempt.amount_paid,
        };

        let response = self
            .backoff
            .run("provisioning request", || {
                post_json(&self.client, &self.url, &request)
            })
            .await
            .map_err(|e| SettlementError::Provisioning(e.to_string()))?;

        response
            .json::<Credential>()
            .await
            .map_err(|e| SettlementError::Provisioning(format!("malformed credential: {}", e)))
    }
}
