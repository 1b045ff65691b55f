use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    events::{ChatEvent, Topic},
    services::{
        auth::{get_user_id, AuthGuard},
        conversations::ConversationService,
    },
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct WsIncomingMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct WsOutgoingMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub payload: serde_json::Value,
}

/// Per-connection lifecycle. `Closed` is terminal; a closed connection's
/// subscription handle is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Pending,
    Authorized,
    Streaming,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: SubscriptionState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: SubscriptionState::Pending,
        }
    }

    fn authorize(&mut self) -> bool {
        if self.state == SubscriptionState::Pending {
            self.state = SubscriptionState::Authorized;
            return true;
        }
        false
    }

    fn stream(&mut self) -> bool {
        if self.state == SubscriptionState::Authorized {
            self.state = SubscriptionState::Streaming;
            return true;
        }
        false
    }

    fn close(&mut self) {
        self.state = SubscriptionState::Closed;
    }
}

/// Subscription handshake. The token rides in the query string because
/// browsers cannot attach headers to an upgrade request; the guard runs
/// before the upgrade is accepted, so an unauthenticated connection never
/// touches the bus.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    query: Option<Query<WsQuery>>,
) -> AppResult<Response> {
    let mut lifecycle = Lifecycle::new();

    // A handshake without a token is an unauthenticated connection, not a
    // malformed request.
    let Query(query) = query.ok_or(AppError::Unauthorized)?;

    let guard = AuthGuard::new(state.config.jwt.clone());
    let claims = guard.validate_token(&query.token)?;
    let user_id = get_user_id(&claims)?;
    lifecycle.authorize();

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, lifecycle)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    user_id: Uuid,
    mut lifecycle: Lifecycle,
) {
    let mut subscription = state.bus.subscribe(&Topic::ALL).await;
    lifecycle.stream();
    tracing::debug!(user = %user_id, "subscription streaming");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    // Deliver only to actual participants of the event's
                    // conversation.
                    if !event.is_for(user_id) {
                        continue;
                    }
                    match outgoing_frame(&event) {
                        Ok(frame) => {
                            if ws_sender.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("dropping unencodable event: {}", e);
                        }
                    }
                }
                None => break,
            },
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_incoming(&state, user_id, &text, &mut ws_sender).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    // Runs on graceful close and abnormal drop alike; idempotent.
    subscription.close().await;
    lifecycle.close();
    tracing::debug!(user = %user_id, "subscription closed");
}

/// Inbound frames never terminate the stream; bad ones are logged and
/// dropped.
async fn handle_incoming(
    state: &AppState,
    user_id: Uuid,
    text: &str,
    ws_sender: &mut SplitSink<WebSocket, Message>,
) {
    let msg = match serde_json::from_str::<WsIncomingMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(user = %user_id, "dropping undecodable frame: {}", e);
            return;
        }
    };

    match msg.msg_type.as_str() {
        "ping" => {
            let pong = WsOutgoingMessage {
                msg_type: "pong",
                payload: serde_json::json!({}),
            };
            if let Ok(frame) = serde_json::to_string(&pong) {
                let _ = ws_sender.send(Message::Text(frame)).await;
            }
        }
        "mark_seen" => {
            let conversation_id = msg
                .payload
                .get("conversationId")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            match conversation_id {
                Some(conversation_id) => {
                    let service = ConversationService::new(state.db.clone(), state.events.clone());
                    if let Err(e) = service.mark_seen(conversation_id, user_id).await {
                        tracing::warn!(user = %user_id, "mark_seen failed: {}", e);
                    }
                }
                None => {
                    tracing::warn!(user = %user_id, "mark_seen without conversationId");
                }
            }
        }
        other => {
            tracing::warn!(user = %user_id, "unknown message type: {}", other);
        }
    }
}

fn outgoing_frame(event: &ChatEvent) -> serde_json::Result<String> {
    let out = match event {
        ChatEvent::ConversationCreated { conversation } => WsOutgoingMessage {
            msg_type: "conversation_created",
            payload: serde_json::to_value(conversation)?,
        },
        ChatEvent::MessageSent {
            conversation_id,
            message,
            ..
        } => WsOutgoingMessage {
            msg_type: "message_sent",
            payload: serde_json::json!({
                "conversationId": conversation_id,
                "message": message,
            }),
        },
    };
    serde_json::to_string(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::{MessagePopulated, UserSummary};

    #[test]
    fn lifecycle_walks_forward_only() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.authorize());
        assert!(lifecycle.stream());
        lifecycle.close();

        // Closed is terminal.
        assert!(!lifecycle.authorize());
        assert!(!lifecycle.stream());
        assert_eq!(lifecycle.state, SubscriptionState::Closed);
    }

    #[test]
    fn streaming_requires_authorization_first() {
        let mut lifecycle = Lifecycle::new();
        assert!(!lifecycle.stream());
        assert!(lifecycle.authorize());
        assert!(!lifecycle.authorize());
    }

    #[tokio::test]
    async fn handshake_without_token_is_rejected_as_unauthenticated() {
        use std::sync::Arc;

        use axum::{
            body::{to_bytes, Body},
            http::{Request, StatusCode},
        };
        use tower::ServiceExt;

        use crate::api::middleware::tests::{test_app, test_state, RecordingSink};

        let sink = Arc::new(RecordingSink {
            events: tokio::sync::Mutex::new(Vec::new()),
        });
        let state = test_state(sink.clone());

        for uri in ["/api/v1/ws", "/api/v1/ws?token=not-a-jwt"] {
            let response = test_app(state.clone())
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .header("connection", "upgrade")
                        .header("upgrade", "websocket")
                        .header("sec-websocket-version", "13")
                        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
            let body = to_bytes(response.into_body(), 1024).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["error"], "Not Authorised", "{}", uri);
        }

        // The guard rejected before any bus registration.
        assert!(sink.events.lock().await.is_empty());
    }

    #[test]
    fn message_frame_carries_conversation_id_and_payload() {
        let conversation_id = Uuid::new_v4();
        let event = ChatEvent::MessageSent {
            conversation_id,
            participant_ids: vec![],
            message: MessagePopulated {
                id: Uuid::new_v4(),
                sender: UserSummary {
                    id: Uuid::new_v4(),
                    username: Some("alice".to_string()),
                },
                body: "hello".to_string(),
                created_at: Utc::now(),
            },
        };

        let frame: serde_json::Value =
            serde_json::from_str(&outgoing_frame(&event).unwrap()).unwrap();
        assert_eq!(frame["type"], "message_sent");
        assert_eq!(
            frame["payload"]["conversationId"],
            conversation_id.to_string()
        );
        assert_eq!(frame["payload"]["message"]["body"], "hello");
    }
}
