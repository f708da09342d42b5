// Copyright (c) 2024 Botho Foundation

//! Posts events to a webhook URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::Notifier;
use crate::{
    events::SettlementEvent,
    http::{post_json, Backoff},
};

const DEFAULT_BACKOFF: Backoff = Backoff::linear(3, Duration::from_secs(1));

/// Delivers each event as a JSON POST.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    backoff: Backoff,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Self::with_backoff(url, DEFAULT_BACKOFF)
    }

    pub fn with_backoff(url: &str, backoff: Backoff) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            url: url.to_string(),
            backoff,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &SettlementEvent) -> anyhow::Result<()> {
        let what = format!("{} webhook", event.event_type());
        self.backoff
            .run(&what, || post_json(&self.client, &self.url, event))
            .await?;

        tracing::debug!("Delivered {}", what);
        Ok(())
    }
}
