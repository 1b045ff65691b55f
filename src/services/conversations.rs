use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    events::{ChatEvent, EventSink},
    models::{
        Conversation, ConversationPopulated, MessagePopulated, Participant, ParticipantPopulated,
        UserSummary,
    },
};

pub struct ConversationService {
    db: PgPool,
    events: Arc<dyn EventSink>,
}

impl ConversationService {
    pub fn new(db: PgPool, events: Arc<dyn EventSink>) -> Self {
        Self { db, events }
    }

    /// Create a conversation with the given participant set. One transaction
    /// covers the conversation row and every participant row; the creation
    /// event goes out only after the commit.
    pub async fn create_conversation(
        &self,
        caller_id: Uuid,
        participant_ids: Vec<Uuid>,
    ) -> AppResult<Uuid> {
        if participant_ids.is_empty() {
            return Err(AppError::Validation(
                "participantIds must not be empty".to_string(),
            ));
        }

        let seed = participant_seed(caller_id, &participant_ids);

        let conversation_id = self.insert_conversation(&seed).await.map_err(|e| {
            tracing::error!("conversation insert failed: {}", e);
            AppError::ConversationCreate
        })?;

        // The write is durable from here on. A populate failure costs the
        // real-time event, not the response; failing the request now would
        // invite a retry that duplicates the conversation.
        match self.fetch_populated(conversation_id).await {
            Ok(conversation) => {
                self.events
                    .publish(ChatEvent::ConversationCreated { conversation })
                    .await;
            }
            Err(e) => {
                tracing::error!(
                    conversation = %conversation_id,
                    "conversation committed but populate failed, skipping event: {}",
                    e
                );
            }
        }

        Ok(conversation_id)
    }

    /// Every conversation the caller participates in, most recently updated
    /// first. Membership is filtered in the query, not after the fact.
    pub async fn list_conversations(
        &self,
        caller_id: Uuid,
    ) -> AppResult<Vec<ConversationPopulated>> {
        let conversations: Vec<Conversation> = sqlx::query_as(
            r#"
            SELECT c.id, c.latest_message_id, c.created_at, c.updated_at
            FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1
            ORDER BY c.updated_at DESC
            "#,
        )
        .bind(caller_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| {
            tracing::error!("conversation list failed: {}", e);
            AppError::ConversationFetch
        })?;

        let mut result = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let populated = self.populate(conversation).await.map_err(|e| {
                tracing::error!("conversation populate failed: {}", e);
                AppError::ConversationFetch
            })?;
            result.push(populated);
        }

        Ok(result)
    }

    /// Flip the caller's seen flag for a conversation they participate in.
    pub async fn mark_seen(&self, conversation_id: Uuid, caller_id: Uuid) -> AppResult<()> {
        let participant: Option<Participant> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, user_id, has_seen_latest_message
            FROM conversation_participants
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(caller_id)
        .fetch_optional(&self.db)
        .await?;

        let participant = participant.ok_or(AppError::NotParticipant)?;
        if participant.has_seen_latest_message {
            return Ok(());
        }

        sqlx::query(
            "UPDATE conversation_participants SET has_seen_latest_message = TRUE WHERE id = $1",
        )
        .bind(participant.id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn insert_conversation(&self, seed: &[(Uuid, bool)]) -> Result<Uuid, sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let conversation_id = Uuid::new_v4();
        sqlx::query("INSERT INTO conversations (id) VALUES ($1)")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        for (user_id, has_seen) in seed {
            sqlx::query(
                r#"
                INSERT INTO conversation_participants (id, conversation_id, user_id, has_seen_latest_message)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(conversation_id)
            .bind(user_id)
            .bind(has_seen)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(conversation_id)
    }

    async fn fetch_populated(
        &self,
        conversation_id: Uuid,
    ) -> Result<ConversationPopulated, sqlx::Error> {
        let conversation: Conversation = sqlx::query_as(
            "SELECT id, latest_message_id, created_at, updated_at FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&self.db)
        .await?;

        self.populate(conversation).await
    }

    async fn populate(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationPopulated, sqlx::Error> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.has_seen_latest_message, u.id AS user_id, u.username
            FROM conversation_participants p
            JOIN users u ON u.id = p.user_id
            WHERE p.conversation_id = $1
            "#,
        )
        .bind(conversation.id)
        .fetch_all(&self.db)
        .await?;

        let latest_message = match conversation.latest_message_id {
            Some(message_id) => {
                let row: MessageRow = sqlx::query_as(
                    r#"
                    SELECT m.id, m.body, m.created_at, u.id AS sender_id, u.username AS sender_username
                    FROM messages m
                    JOIN users u ON u.id = m.sender_id
                    WHERE m.id = $1
                    "#,
                )
                .bind(message_id)
                .fetch_one(&self.db)
                .await?;
                Some(MessagePopulated {
                    id: row.id,
                    sender: UserSummary {
                        id: row.sender_id,
                        username: row.sender_username,
                    },
                    body: row.body,
                    created_at: row.created_at,
                })
            }
            None => None,
        };

        Ok(ConversationPopulated {
            id: conversation.id,
            participants: rows
                .into_iter()
                .map(|row| ParticipantPopulated {
                    id: row.id,
                    user: UserSummary {
                        id: row.user_id,
                        username: row.username,
                    },
                    has_seen_latest_message: row.has_seen_latest_message,
                })
                .collect(),
            latest_message,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ParticipantRow {
    id: Uuid,
    has_seen_latest_message: bool,
    user_id: Uuid,
    username: Option<String>,
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    body: String,
    created_at: DateTime<Utc>,
    sender_id: Uuid,
    sender_username: Option<String>,
}

/// Deduplicated (user_id, has_seen_latest_message) pairs to insert for a new
/// conversation. The creator has already seen the (empty) conversation;
/// everyone else has not.
fn participant_seed(caller_id: Uuid, participant_ids: &[Uuid]) -> Vec<(Uuid, bool)> {
    let mut seen = std::collections::HashSet::new();
    participant_ids
        .iter()
        .filter(|id| seen.insert(**id))
        .map(|&id| (id, id == caller_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_dedups_and_keeps_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let seed = participant_seed(a, &[a, b, a, c, b]);
        let ids: Vec<Uuid> = seed.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn only_creator_starts_with_seen_flag() {
        let caller = Uuid::new_v4();
        let other = Uuid::new_v4();

        let seed = participant_seed(caller, &[caller, other]);
        assert_eq!(seed, vec![(caller, true), (other, false)]);
    }

    #[test]
    fn seed_matches_dedup_cardinality() {
        let caller = Uuid::new_v4();
        let others: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let mut ids = vec![caller];
        ids.extend(&others);
        ids.extend(&others); // every id twice

        let seed = participant_seed(caller, &ids);
        assert_eq!(seed.len(), others.len() + 1);
    }

    use crate::api::middleware::tests::RecordingSink;

    fn dead_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://postgres@127.0.0.1:1/parley_test")
            .unwrap()
    }

    fn recording() -> (Arc<RecordingSink>, Arc<dyn EventSink>) {
        let recorder = Arc::new(RecordingSink {
            events: tokio::sync::Mutex::new(Vec::new()),
        });
        let sink: Arc<dyn EventSink> = recorder.clone();
        (recorder, sink)
    }

    #[tokio::test]
    async fn empty_participant_set_is_rejected_before_any_side_effect() {
        let (recorder, sink) = recording();
        let service = ConversationService::new(dead_pool(), sink);

        let result = service
            .create_conversation(Uuid::new_v4(), Vec::new())
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(recorder.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_insert_surfaces_generic_error_and_publishes_nothing() {
        let (recorder, sink) = recording();
        let service = ConversationService::new(dead_pool(), sink);

        let caller = Uuid::new_v4();
        let result = service
            .create_conversation(caller, vec![caller, Uuid::new_v4()])
            .await;

        assert!(matches!(result, Err(AppError::ConversationCreate)));
        assert!(recorder.events.lock().await.is_empty());
    }
}
