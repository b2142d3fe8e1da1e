//! Party notifications.

use async_trait::async_trait;
use cashbridge_common::PartyId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Escrow lifecycle events delivered to parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowEvent {
    EscrowCreated,
    EscrowFunded,
    EscrowCompleted,
    EscrowExpired,
    EscrowRefunded,
    EscrowDisputed,
}

impl EscrowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowEvent::EscrowCreated => "escrow_created",
            EscrowEvent::EscrowFunded => "escrow_funded",
            EscrowEvent::EscrowCompleted => "escrow_completed",
            EscrowEvent::EscrowExpired => "escrow_expired",
            EscrowEvent::EscrowRefunded => "escrow_refunded",
            EscrowEvent::EscrowDisputed => "escrow_disputed",
        }
    }
}

/// A delivered notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub party: PartyId,
    pub event: EscrowEvent,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No subscriber for party {0}")]
    NoSubscriber(PartyId),

    #[error("Channel for party {0} is closed")]
    Closed(PartyId),
}

/// Outbound messaging port.
///
/// Delivery is best effort: the coordinator logs failures and carries on.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(
        &self,
        party: &PartyId,
        event: EscrowEvent,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationPort for LoggingNotifier {
    async fn notify(
        &self,
        party: &PartyId,
        event: EscrowEvent,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        info!(party = %party, event = event.as_str(), payload = %payload, "Notification");
        Ok(())
    }
}

/// Fans notifications out to per-party channels.
pub struct ChannelNotifier {
    channels: DashMap<PartyId, mpsc::Sender<Notification>>,
    capacity: usize,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Register a party, replacing any earlier subscription.
    pub fn subscribe(&self, party: PartyId) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!(party = %party, "Party subscribed");
        self.channels.insert(party, tx);
        rx
    }

    pub fn unsubscribe(&self, party: &PartyId) {
        self.channels.remove(party);
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationPort for ChannelNotifier {
    async fn notify(
        &self,
        party: &PartyId,
        event: EscrowEvent,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let sender = self
            .channels
            .get(party)
            .map(|s| s.clone())
            .ok_or_else(|| NotifyError::NoSubscriber(party.clone()))?;

        let notification = Notification {
            party: party.clone(),
            event,
            payload,
            sent_at: Utc::now(),
        };

        sender
            .send(notification)
            .await
            .map_err(|_| NotifyError::Closed(party.clone()))
    }
}
