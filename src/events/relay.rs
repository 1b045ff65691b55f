use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::redis::RedisClient;

use super::{ChatEvent, EventBus, EventSink};

/// What crosses Redis between instances. The origin id lets each instance
/// skip the echo of its own publishes.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    event: ChatEvent,
}

/// Production [`EventSink`]: fans out on the local bus and mirrors the event
/// to Redis so subscribers on other instances see it too. The mirror leg is
/// best-effort; by the time we publish, the write has already committed, so
/// a Redis failure only costs real-time delivery, never durable state.
pub struct RelayedSink {
    bus: Arc<EventBus>,
    redis: RedisClient,
    instance_id: Uuid,
}

impl RelayedSink {
    pub fn new(bus: Arc<EventBus>, redis: RedisClient, instance_id: Uuid) -> Self {
        Self {
            bus,
            redis,
            instance_id,
        }
    }
}

#[async_trait::async_trait]
impl EventSink for RelayedSink {
    async fn publish(&self, event: ChatEvent) {
        let topic = event.topic();
        let envelope = Envelope {
            origin: self.instance_id,
            event: event.clone(),
        };

        self.bus.publish(event).await;

        match serde_json::to_string(&envelope) {
            Ok(payload) => {
                if let Err(e) = self.redis.publish_event(topic, &payload).await {
                    tracing::warn!(topic = topic.as_str(), "event relay publish failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("event serialization failed: {}", e),
        }
    }
}

/// Background task: re-publish events arriving from other instances onto the
/// local bus. Reconnects with a delay when the Redis connection drops; a
/// payload that does not decode is dropped with a log, never fatal.
pub async fn run_relay(bus: Arc<EventBus>, redis: RedisClient, instance_id: Uuid) {
    loop {
        match redis.subscribe_events().await {
            Ok(mut pubsub) => {
                tracing::info!("event relay subscribed");
                while let Some(msg) = pubsub.on_message().next().await {
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    match serde_json::from_str::<Envelope>(&payload) {
                        Ok(envelope) if envelope.origin != instance_id => {
                            bus.publish(envelope.event).await;
                        }
                        Ok(_) => {} // our own echo
                        Err(e) => {
                            tracing::warn!("dropping undecodable relay payload: {}", e);
                        }
                    }
                }
                tracing::warn!("event relay stream ended, reconnecting");
            }
            Err(e) => {
                tracing::warn!("event relay subscribe failed: {}", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
