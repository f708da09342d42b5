// Copyright (c) 2024 Botho Foundation

//! Settlement domain events.
//!
//! The engine publishes events here instead of calling notification code
//! directly; adapters subscribe to the bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::AttemptId;

/// Default bus capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something that happened to a payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    /// A partial payment was credited
    PaymentReceived {
        attempt_id: AttemptId,
        owner_id: String,
        signature: String,
        amount: u64,
        amount_paid: u64,
        remaining: u64,
    },
    /// The attempt was fully paid
    AttemptCompleted {
        attempt_id: AttemptId,
        owner_id: String,
        tier: String,
        duration_units: u32,
        amount_paid: u64,
    },
    /// Provisioning issued a credential for a completed attempt
    CredentialIssued {
        attempt_id: AttemptId,
        owner_id: String,
        credential_ref: String,
    },
    /// Unpaid attempts passed their deadline
    AttemptsExpired { attempt_ids: Vec<AttemptId> },
    /// Deposit funds were moved to the treasury
    Swept {
        attempt_id: AttemptId,
        signature: String,
        amount: u64,
    },
}

impl SettlementEvent {
    /// Short name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            SettlementEvent::PaymentReceived { .. } => "payment_received",
            SettlementEvent::AttemptCompleted { .. } => "attempt_completed",
            SettlementEvent::CredentialIssued { .. } => "credential_issued",
            SettlementEvent::AttemptsExpired { .. } => "attempts_expired",
            SettlementEvent::Swept { .. } => "swept",
        }
    }

    /// Owner to notify, if the event concerns a single payer.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            SettlementEvent::PaymentReceived { owner_id, .. }
            | SettlementEvent::AttemptCompleted { owner_id, .. }
            | SettlementEvent::CredentialIssued { owner_id, .. } => Some(owner_id),
            SettlementEvent::AttemptsExpired { .. } | SettlementEvent::Swept { .. } => None,
        }
    }
}

/// Broadcast bus for settlement events.
///
/// Clone this to share across the application.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SettlementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: SettlementEvent) {
        tracing::debug!("Publishing {} event", event.event_type());
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
