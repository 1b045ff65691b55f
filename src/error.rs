use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    // Auth errors
    #[error("Not Authorised")]
    Unauthorized,
    #[error("Invalid token")]
    InvalidToken,

    // User errors
    #[error("User not found")]
    UserNotFound,
    #[error("Username already taken. try another")]
    UsernameTaken,
    #[error("Username already set")]
    UsernameAlreadySet,

    // Conversation errors
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("Not a participant")]
    NotParticipant,

    // Opaque service failures; the real cause is logged where it happens
    #[error("Error creating conversation")]
    ConversationCreate,
    #[error("Error fetching conversations")]
    ConversationFetch,
    #[error("Error sending message")]
    MessageSend,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Bad request: {0}")]
    BadRequest(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // JWT errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    // Internal errors
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // 400 Bad Request
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),

            // 401 Unauthorized
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Jwt(_) => (StatusCode::UNAUTHORIZED, "Invalid token".to_string()),

            // 403 Forbidden
            AppError::NotParticipant => (StatusCode::FORBIDDEN, self.to_string()),

            // 404 Not Found
            AppError::UserNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::ConversationNotFound => (StatusCode::NOT_FOUND, self.to_string()),

            // 409 Conflict
            AppError::UsernameTaken => (StatusCode::CONFLICT, self.to_string()),
            AppError::UsernameAlreadySet => (StatusCode::CONFLICT, self.to_string()),

            // 500 Internal Server Error
            AppError::ConversationCreate | AppError::ConversationFetch | AppError::MessageSend => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// True when the database rejected a write on a unique index (SQLSTATE 23505).
/// Used to turn a username-claim race into a structured conflict.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_uses_wire_message() {
        assert_eq!(AppError::Unauthorized.to_string(), "Not Authorised");
    }

    #[test]
    fn username_conflict_uses_wire_message() {
        assert_eq!(
            AppError::UsernameTaken.to_string(),
            "Username already taken. try another"
        );
    }

    #[test]
    fn repeated_username_claim_is_a_distinct_conflict() {
        assert_eq!(
            AppError::UsernameAlreadySet.to_string(),
            "Username already set"
        );
    }

    #[test]
    fn opaque_service_errors_hide_detail() {
        assert_eq!(
            AppError::ConversationCreate.to_string(),
            "Error creating conversation"
        );
        assert_eq!(
            AppError::ConversationFetch.to_string(),
            "Error fetching conversations"
        );
    }
}
