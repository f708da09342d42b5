// Copyright (c) 2024 Botho Foundation

//! Notification adapters for settlement events.
//!
//! Notifiers consume [`SettlementEvent`]s from the [`EventBus`]; the engine
//! never calls them directly, so a slow or failing notifier cannot block
//! settlement.

mod stdout;
mod webhook;

pub use stdout::StdoutNotifier;
pub use webhook::WebhookNotifier;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::events::{EventBus, SettlementEvent};

/// Delivers settlement events to the outside world.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &SettlementEvent) -> anyhow::Result<()>;
}

/// Pick a notifier: webhook if a URL is configured, stdout otherwise.
pub fn create_notifier(webhook_url: Option<&str>) -> anyhow::Result<Arc<dyn Notifier>> {
    match webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url)?)),
        None => Ok(Arc::new(StdoutNotifier::new())),
    }
}

/// Forward every event on `bus` to `notifier` until the bus closes.
///
/// Delivery failures are logged and dropped.
pub fn spawn_dispatcher(bus: &EventBus, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = notifier.notify(&event).await {
                        tracing::error!("Failed to deliver {} event: {}", event.event_type(), e);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Notification dispatcher lagged, skipped {} events", n);
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("Event bus closed, stopping dispatcher");
                    break;
                }
            }
        }
    })
}
