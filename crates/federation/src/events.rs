//! Internal event bus.
//!
//! Events are broadcast in process over a tokio channel and, when an
//! [`EventRelay`] is attached, forwarded to the other processes of the
//! deployment. Subscribers use them to invalidate caches.

#![allow(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the in-process channel.
const CHANNEL_CAPACITY: usize = 1024;

/// Something other components may need to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum InternalEvent {
    /// A remote user's profile, key or state changed.
    RemoteUserUpdated { user_id: String, uri: String },
    /// An instance's health or metadata changed.
    InstanceUpdated { host: String },
}

impl InternalEvent {
    /// Channel-style name, used as the log field.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RemoteUserUpdated { .. } => "remoteUserUpdated",
            Self::InstanceUpdated { .. } => "instanceUpdated",
        }
    }
}

/// Error raised by an [`EventRelay`].
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("relay error: {0}")]
    Relay(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Forwards events to other processes.
#[async_trait]
pub trait EventRelay: Send + Sync {
    async fn publish(&self, event: &InternalEvent) -> Result<(), EventError>;
}

/// Publish/subscribe hub for [`InternalEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InternalEvent>,
    relay: Option<Arc<dyn EventRelay>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// A process-local bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            relay: None,
        }
    }

    /// Forward every published event through `relay` as well.
    #[must_use]
    pub fn with_relay(mut self, relay: Arc<dyn EventRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InternalEvent> {
        self.sender.subscribe()
    }

    /// Publish locally and to the relay. Relay failures are logged.
    pub async fn publish(&self, event: InternalEvent) {
        debug!(event = event.name(), "Publishing internal event");
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.publish(&event).await {
                warn!(event = event.name(), error = %e, "Failed to relay internal event");
            }
        }
        self.deliver_local(event);
    }

    /// Hand an event to local subscribers only (used for relayed events).
    pub fn deliver_local(&self, event: InternalEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}
