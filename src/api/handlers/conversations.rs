use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{ConversationPopulated, MessagePopulated},
    services::{
        auth::{get_user_id, Claims},
        conversations::ConversationService,
        messages::MessageService,
    },
    AppState,
};

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<Vec<ConversationPopulated>>> {
    let user_id = get_user_id(&claims)?;

    let conversation_service = ConversationService::new(state.db, state.events);
    let conversations = conversation_service.list_conversations(user_id).await?;

    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationResponse {
    pub conversation_id: Uuid,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> AppResult<Json<CreateConversationResponse>> {
    let user_id = get_user_id(&claims)?;

    let conversation_service = ConversationService::new(state.db, state.events);
    let conversation_id = conversation_service
        .create_conversation(user_id, req.participant_ids)
        .await?;

    Ok(Json(CreateConversationResponse { conversation_id }))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Json<MessagePopulated>> {
    let user_id = get_user_id(&claims)?;

    let message_service = MessageService::new(state.db, state.events);
    let message = message_service
        .send_message(user_id, conversation_id, req.body)
        .await?;

    Ok(Json(message))
}

#[derive(Debug, Serialize)]
pub struct MarkSeenResponse {
    pub success: bool,
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<MarkSeenResponse>> {
    let user_id = get_user_id(&claims)?;

    let conversation_service = ConversationService::new(state.db, state.events);
    conversation_service.mark_seen(conversation_id, user_id).await?;

    Ok(Json(MarkSeenResponse { success: true }))
}
