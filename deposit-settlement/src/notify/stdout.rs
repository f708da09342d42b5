// Copyright (c) 2024 Botho Foundation

//! Prints events as JSON lines.

use async_trait::async_trait;

use super::Notifier;
use crate::events::SettlementEvent;

/// Writes each event to stdout as one JSON line.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

impl StdoutNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn notify(&self, event: &SettlementEvent) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    }
}
