use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    models::{User, UserSummary},
    services::{
        auth::{get_user_id, Claims},
        users::UserService,
    },
    AppState,
};

pub async fn get_current_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<User>> {
    let user_id = get_user_id(&claims)?;

    let user_service = UserService::new(state.db);
    let user = user_service.get_user(user_id).await?;

    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct CreateUsernameRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct CreateUsernameResponse {
    pub success: bool,
}

pub async fn create_username(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateUsernameRequest>,
) -> AppResult<Json<CreateUsernameResponse>> {
    let user_id = get_user_id(&claims)?;

    let user_service = UserService::new(state.db);
    user_service.create_username(user_id, &req.username).await?;

    Ok(Json(CreateUsernameResponse { success: true }))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub username: String,
    #[serde(default = "default_limit")]
    pub limit: i32,
}

fn default_limit() -> i32 {
    20
}

pub async fn search_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Vec<UserSummary>>> {
    let user_id = get_user_id(&claims)?;

    if query.username.is_empty() {
        return Err(AppError::BadRequest("Search query required".to_string()));
    }

    let user_service = UserService::new(state.db);
    let users = user_service
        .search_users(user_id, &query.username, query.limit)
        .await?;

    Ok(Json(users))
}
