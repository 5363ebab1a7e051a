//! Redis Pub/Sub bridge for internal events.
//!
//! Lets every process of a deployment see cache invalidations published by
//! the others.

use apkernel_common::IdGenerator;
use apkernel_federation::events::{EventBus, EventError, EventRelay, InternalEvent};
use async_trait::async_trait;
use fred::clients::{Client, SubscriberClient};
use fred::error::Error as RedisError;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use fred::types::config::Config as RedisConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Channel suffix for internal events.
pub const INTERNAL_CHANNEL: &str = "internal";

/// An event tagged with the process that published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub event: InternalEvent,
}

/// [`EventRelay`] over Redis Pub/Sub.
#[derive(Clone)]
pub struct RedisEventRelay {
    publisher: Client,
    subscriber: SubscriberClient,
    channel: String,
    source: String,
}

impl RedisEventRelay {
    /// Connect a publisher and a subscriber client.
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, RedisError> {
        let config = RedisConfig::from_url(redis_url)?;

        let publisher = Client::new(config.clone(), None, None, None);
        publisher.init().await?;

        let subscriber = SubscriberClient::new(config, None, None, None);
        subscriber.init().await?;

        info!("Redis Pub/Sub initialized");

        Ok(Self {
            publisher,
            subscriber,
            channel: format!("{prefix}:{INTERNAL_CHANNEL}"),
            source: IdGenerator::new().generate(),
        })
    }

    /// Subscribe and hand events from other processes to `bus`.
    pub async fn start(&self, bus: EventBus) -> Result<(), RedisError> {
        self.subscriber.subscribe(self.channel.as_str()).await?;
        info!(channel = %self.channel, "Subscribed to internal event channel");

        let source = self.source.clone();
        let mut message_stream = self.subscriber.message_rx();

        tokio::spawn(async move {
            while let Ok(message) = message_stream.recv().await {
                let Some(payload) = message.value.as_string() else {
                    continue;
                };
                if let Some(event) = decode_remote(&payload, &source) {
                    debug!(event = event.name(), "Received relayed event");
                    bus.deliver_local(event);
                }
            }
            info!("Pub/Sub message stream ended");
        });

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), RedisError> {
        self.subscriber.quit().await?;
        self.publisher.quit().await?;
        info!("Redis Pub/Sub shutdown");
        Ok(())
    }
}

#[async_trait]
impl EventRelay for RedisEventRelay {
    async fn publish(&self, event: &InternalEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(&Envelope {
            source: self.source.clone(),
            event: event.clone(),
        })?;
        let _: () = self
            .publisher
            .publish(self.channel.as_str(), payload)
            .await
            .map_err(|e| EventError::Relay(e.to_string()))?;
        Ok(())
    }
}

/// The event in `payload` unless this process published it.
fn decode_remote(payload: &str, own_source: &str) -> Option<InternalEvent> {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) if envelope.source == own_source => None,
        Ok(envelope) => Some(envelope.event),
        Err(e) => {
            warn!(error = %e, "Failed to parse Pub/Sub message");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_own_events_are_ignored() {
        let payload = serde_json::to_string(&Envelope {
            source: "a".to_string(),
            event: InternalEvent::InstanceUpdated {
                host: "remote.example".to_string(),
            },
        })
        .unwrap();

        assert_eq!(decode_remote(&payload, "a"), None);
        assert_eq!(
            decode_remote(&payload, "b"),
            Some(InternalEvent::InstanceUpdated {
                host: "remote.example".to_string()
            })
        );
        assert_eq!(decode_remote("not json", "b"), None);
    }
}
