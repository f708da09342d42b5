// Copyright (c) 2024 Botho Foundation

//! Outbound HTTP helpers shared by the webhook notifier and the
//! provisioning client.

use std::{fmt::Display, future::Future, time::Duration};

use reqwest::{Client, Response};
use serde::Serialize;
use tracing::warn;

/// Linear backoff: retry `n` sleeps `n * step` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub retries: u32,
    pub step: Duration,
}

impl Backoff {
    pub const fn linear(retries: u32, step: Duration) -> Self {
        Self { retries, step }
    }

    /// Run `op` until it succeeds or the retries are used up, returning the
    /// last error.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.retries => {
                    retry += 1;
                    warn!("{} failed, retry {}/{}: {}", what, retry, self.retries, e);
                    tokio::time::sleep(self.step * retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// POST `body` as JSON; a non-2xx status is an error carrying the start of
/// the response body.
pub async fn post_json<B>(client: &Client, url: &str, body: &B) -> anyhow::Result<Response>
where
    B: Serialize + ?Sized,
{
    let response = client.post(url).json(body).send().await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!(
            "{} returned status {}: {}",
            url,
            status,
            text.chars().take(200).collect::<String>()
        );
    }
    Ok(response)
}
