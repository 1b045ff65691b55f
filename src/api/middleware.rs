use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::{error::AppError, services::auth::AuthGuard, AppState};

/// Authentication middleware. Rejects before the handler runs, so an
/// unauthenticated call never reaches persistence or the event bus.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let guard = AuthGuard::new(state.config.jwt.clone());
    let claims = guard.validate_token(token)?;

    // Insert claims into request extensions
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    use crate::{
        api,
        config::Config,
        events::{ChatEvent, EventBus, EventSink},
        AppState,
    };

    pub struct RecordingSink {
        pub events: tokio::sync::Mutex<Vec<ChatEvent>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: ChatEvent) {
            self.events.lock().await.push(event);
        }
    }

    /// State over a lazy pool pointing nowhere: any handler that touches
    /// persistence errors out fast, and a request rejected at the guard
    /// never gets that far.
    pub fn test_state(sink: Arc<RecordingSink>) -> AppState {
        let db = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://postgres@127.0.0.1:1/parley_test")
            .unwrap();
        AppState {
            db,
            config: Arc::new(Config::load()),
            bus: Arc::new(EventBus::new()),
            events: sink,
        }
    }

    pub fn test_app(state: AppState) -> Router {
        Router::new()
            .nest("/api/v1", api::router::create_router(state.clone()))
            .with_state(state)
    }

    async fn wire_error(response: axum::response::Response) -> (StatusCode, String) {
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json["error"].as_str().unwrap_or_default().to_string())
    }

    #[tokio::test]
    async fn calls_without_credentials_are_rejected_with_no_side_effects() {
        let sink = Arc::new(RecordingSink {
            events: tokio::sync::Mutex::new(Vec::new()),
        });
        let state = test_state(sink.clone());

        let protected = [
            ("GET", "/api/v1/conversations"),
            ("POST", "/api/v1/conversations"),
            ("GET", "/api/v1/users/search?username=al"),
            ("POST", "/api/v1/users/username"),
            ("GET", "/api/v1/users/me"),
        ];

        for (method, uri) in protected {
            let response = test_app(state.clone())
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            let (status, error) = wire_error(response).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{} {}", method, uri);
            assert_eq!(error, "Not Authorised", "{} {}", method, uri);
        }

        // Nothing reached a handler, so nothing was published.
        assert!(sink.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn garbage_bearer_token_is_rejected() {
        let sink = Arc::new(RecordingSink {
            events: tokio::sync::Mutex::new(Vec::new()),
        });
        let state = test_state(sink.clone());

        let response = test_app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/conversations")
                    .header("authorization", "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, error) = wire_error(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error, "Not Authorised");
        assert!(sink.events.lock().await.is_empty());
    }
}
