use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationPopulated, MessagePopulated};

pub mod bus;
pub mod relay;

pub use bus::{EventBus, Subscription};
pub use relay::RelayedSink;

/// Named channels on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ConversationCreated,
    MessageSent,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::ConversationCreated, Topic::MessageSent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ConversationCreated => "conversation_created",
            Topic::MessageSent => "message_sent",
        }
    }
}

/// Events fanned out to live subscribers. Published only after the defining
/// write has committed, so a subscriber never sees data that is not yet
/// durably queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ConversationCreated {
        conversation: ConversationPopulated,
    },
    MessageSent {
        conversation_id: Uuid,
        /// Membership snapshot at send time, so the gateway can filter
        /// deliveries without a storage read per event.
        participant_ids: Vec<Uuid>,
        message: MessagePopulated,
    },
}

impl ChatEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ChatEvent::ConversationCreated { .. } => Topic::ConversationCreated,
            ChatEvent::MessageSent { .. } => Topic::MessageSent,
        }
    }

    /// Whether `user_id` is a participant of the event's conversation.
    /// The gateway forwards an event to a connection only if this holds.
    pub fn is_for(&self, user_id: Uuid) -> bool {
        match self {
            ChatEvent::ConversationCreated { conversation } => {
                conversation.has_participant(user_id)
            }
            ChatEvent::MessageSent {
                participant_ids, ..
            } => participant_ids.contains(&user_id),
        }
    }
}

/// The publish seam services depend on. The production implementation is
/// [`RelayedSink`]; tests swap in a recording double.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ChatEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::UserSummary;

    #[test]
    fn message_event_is_for_participants_only() {
        let member = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        let event = ChatEvent::MessageSent {
            conversation_id: Uuid::new_v4(),
            participant_ids: vec![member],
            message: MessagePopulated {
                id: Uuid::new_v4(),
                sender: UserSummary {
                    id: member,
                    username: Some("alice".to_string()),
                },
                body: "hi".to_string(),
                created_at: Utc::now(),
            },
        };

        assert!(event.is_for(member));
        assert!(!event.is_for(outsider));
        assert_eq!(event.topic(), Topic::MessageSent);
    }

    /// Test double for the publish seam services depend on.
    struct RecordingSink {
        events: tokio::sync::Mutex<Vec<ChatEvent>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: ChatEvent) {
            self.events.lock().await.push(event);
        }
    }

    #[tokio::test]
    async fn recording_sink_observes_publishes_through_the_trait() {
        let recorder = std::sync::Arc::new(RecordingSink {
            events: tokio::sync::Mutex::new(Vec::new()),
        });
        let sink: std::sync::Arc<dyn EventSink> = recorder.clone();

        let conversation_id = Uuid::new_v4();
        sink.publish(ChatEvent::MessageSent {
            conversation_id,
            participant_ids: vec![],
            message: MessagePopulated {
                id: Uuid::new_v4(),
                sender: UserSummary {
                    id: Uuid::new_v4(),
                    username: None,
                },
                body: "seam".to_string(),
                created_at: Utc::now(),
            },
        })
        .await;

        let recorded = recorder.events.lock().await;
        assert_eq!(recorded.len(), 1);
        assert!(matches!(
            &recorded[0],
            ChatEvent::MessageSent { conversation_id: c, .. } if *c == conversation_id
        ));
    }
}
