use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    events::{ChatEvent, EventSink},
    models::{Message, MessagePopulated, UserSummary},
};

pub struct MessageService {
    db: PgPool,
    events: Arc<dyn EventSink>,
}

impl MessageService {
    pub fn new(db: PgPool, events: Arc<dyn EventSink>) -> Self {
        Self { db, events }
    }

    /// Append a message. One transaction writes the message row, bumps the
    /// conversation's latest-message pointer, and resets every participant's
    /// seen flag (true only for the sender). The event goes out after commit.
    pub async fn send_message(
        &self,
        caller_id: Uuid,
        conversation_id: Uuid,
        body: String,
    ) -> AppResult<MessagePopulated> {
        if body.trim().is_empty() {
            return Err(AppError::Validation("message body is required".to_string()));
        }

        if !self.is_participant(conversation_id, caller_id).await? {
            if !self.conversation_exists(conversation_id).await? {
                return Err(AppError::ConversationNotFound);
            }
            return Err(AppError::NotParticipant);
        }

        // Gathered before the write so nothing can fail between commit and
        // response; a failure here aborts with nothing durable yet.
        let (sender, participant_ids) = self
            .delivery_context(conversation_id, caller_id)
            .await
            .map_err(|e| {
                tracing::error!("message populate failed: {}", e);
                AppError::MessageSend
            })?;

        let message = self
            .insert_message(conversation_id, caller_id, &body)
            .await
            .map_err(|e| {
                tracing::error!("message insert failed: {}", e);
                AppError::MessageSend
            })?;

        let populated = MessagePopulated {
            id: message.id,
            sender,
            body: message.body,
            created_at: message.created_at,
        };

        // Write is durable at this point; delivery is best-effort.
        self.events
            .publish(ChatEvent::MessageSent {
                conversation_id,
                participant_ids,
                message: populated.clone(),
            })
            .await;

        Ok(populated)
    }

    async fn conversation_exists(&self, conversation_id: Uuid) -> AppResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.is_some())
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.is_some())
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: &str,
    ) -> Result<Message, sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let message: Message = sqlx::query_as(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, body)
            VALUES ($1, $2, $3, $4)
            RETURNING id, conversation_id, sender_id, body, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_id)
        .bind(body)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET latest_message_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(message.id)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        // Only the sender has seen the new latest message.
        sqlx::query(
            r#"
            UPDATE conversation_participants
            SET has_seen_latest_message = (user_id = $1)
            WHERE conversation_id = $2
            "#,
        )
        .bind(sender_id)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn delivery_context(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
    ) -> Result<(UserSummary, Vec<Uuid>), sqlx::Error> {
        let sender: UserSummary =
            sqlx::query_as("SELECT id, username FROM users WHERE id = $1")
                .bind(sender_id)
                .fetch_one(&self.db)
                .await?;

        let participants: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;

        Ok((sender, participants.into_iter().map(|(id,)| id).collect()))
    }
}
