use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{is_unique_violation, AppError, AppResult},
    models::{User, UserSummary},
};

pub struct UserService {
    db: PgPool,
}

impl UserService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn get_user(&self, user_id: Uuid) -> AppResult<User> {
        let user: Option<User> = sqlx::query_as(
            r#"
            SELECT id, name, username, email, image, email_verified, created_at, updated_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        user.ok_or(AppError::UserNotFound)
    }

    /// Claim a username, exactly once per user. The unique index is the
    /// arbiter: under a race, one caller wins and the other gets the
    /// conflict, with no read-then-write window in between.
    pub async fn create_username(&self, caller_id: Uuid, username: &str) -> AppResult<()> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::Validation("username is required".to_string()));
        }

        let result = sqlx::query(
            "UPDATE users SET username = $1, updated_at = NOW() WHERE id = $2 AND username IS NULL",
        )
        .bind(username)
        .bind(caller_id)
        .execute(&self.db)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::UsernameTaken
            } else {
                AppError::Database(e)
            }
        })?;

        if result.rows_affected() == 0 {
            // Either the user is gone, or they already chose a username.
            self.get_user(caller_id).await?;
            return Err(AppError::UsernameAlreadySet);
        }
        Ok(())
    }

    /// Case-insensitive username substring search, excluding the caller and
    /// anyone who has not picked a username yet.
    pub async fn search_users(
        &self,
        caller_id: Uuid,
        query: &str,
        limit: i32,
    ) -> AppResult<Vec<UserSummary>> {
        let pattern = search_pattern(query);

        let users: Vec<UserSummary> = sqlx::query_as(
            r#"
            SELECT id, username FROM users
            WHERE username ILIKE $1 AND id != $2 AND username IS NOT NULL
            ORDER BY username
            LIMIT $3
            "#,
        )
        .bind(&pattern)
        .bind(caller_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(users)
    }
}

/// Substring pattern with LIKE metacharacters neutralized. The backslash
/// goes first, otherwise a trailing `\` in the query would escape the
/// closing wildcard.
fn search_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}
