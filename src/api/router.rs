use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use super::{handlers, middleware::auth_middleware, websocket::handle_websocket};
use crate::AppState;

pub fn create_router(state: AppState) -> Router<AppState> {
    // User routes (protected)
    let user_routes = Router::new()
        .route("/me", get(handlers::users::get_current_user))
        .route("/username", post(handlers::users::create_username))
        .route("/search", get(handlers::users::search_users))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Conversation routes (protected)
    let conversation_routes = Router::new()
        .route("/", get(handlers::conversations::get_conversations))
        .route("/", post(handlers::conversations::create_conversation))
        .route("/:id/messages", post(handlers::conversations::send_message))
        .route("/:id/seen", post(handlers::conversations::mark_seen))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // WebSocket route. Browsers cannot set headers on the upgrade request,
    // so the handshake itself carries the token and the handler runs the
    // guard before accepting.
    let ws_route = Router::new().route("/ws", get(handle_websocket));

    Router::new()
        .nest("/users", user_routes)
        .nest("/conversations", conversation_routes)
        .merge(ws_route)
        .with_state(state)
}
