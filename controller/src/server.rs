//! Internal HTTP surface and the agent attach point
//!
//! Two jobs: serve the out-of-band endpoints (session validation, liveness)
//! and upgrade agent WebSocket connections into bus channels. The socket
//! itself is plumbing; the bus sees only structured messages.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::bus::{AgentKind, AgentMessage};
use crate::error::Result;
use crate::session;
use crate::state::AppState;

/// Build the internal router.
pub fn router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.timeout_secs);
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/auth/session/validate",
            get(session::validate_session),
        )
        .route("/api/v1/agent/ws", get(agent_ws))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.internal_port));
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("internal server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct AgentWsQuery {
    id: String,
    #[serde(rename = "type")]
    kind: AgentKind,
}

/// Upgrade an agent connection. Agent identity arrives in the query string;
/// credential verification happens in the admin surface before agents are
/// handed this URL.
async fn agent_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<AgentWsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, query.kind, query.id))
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: AppState,
    kind: AgentKind,
    agent_id: String,
) {
    let connection_id = Uuid::new_v4();
    tracing::debug!(agent_id = %agent_id, kind = %kind, connection_id = %connection_id, "agent socket open");

    let (mut sink, mut stream) = socket.split();

    // Attach before pumping: connect listeners enqueue the bootstrap view
    // into the fresh channel, and the forward task drains it below.
    let mut outbound = state.bus.attach(kind, agent_id.clone()).await;

    let forward = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode outbound agent message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(message) => state.bus.dispatch(&agent_id, message).await,
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "dropping malformed agent message");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    forward.abort();
    state.bus.detach(&agent_id).await;
    tracing::debug!(agent_id = %agent_id, connection_id = %connection_id, "agent socket closed");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::keys::JwtKeys;
    use crate::model::{Session, User};
    use crate::session::ValidateResponse;
    use crate::store::MemStore;

    // Key generation is slow in debug builds; share one pair across tests.
    fn test_keys() -> JwtKeys {
        static KEYS: std::sync::OnceLock<JwtKeys> = std::sync::OnceLock::new();
        KEYS.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            JwtKeys::ensure(dir.path()).unwrap()
        })
        .clone()
    }

    async fn test_state(store: Arc<MemStore>) -> AppState {
        AppState::new(Config::default(), store, test_keys()).await
    }

    #[tokio::test]
    async fn health_endpoint_answers_ok() {
        let state = test_state(Arc::new(MemStore::new())).await;
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn session_validate_route_is_wired() {
        let store = Arc::new(MemStore::new());
        store.add_user(User {
            user_id: "u1".into(),
            email: "a@x".into(),
        });
        store.add_session(Session {
            session_id: "s1".into(),
            session_token: "abc".into(),
            user_id: "u1".into(),
            expires_at: Utc::now() + Duration::hours(1),
        });
        let state = test_state(store).await;

        let response = router(state)
            .oneshot(
                Request::get("/api/v1/auth/session/validate")
                    .header("cookie", "p_session=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: ValidateResponse = serde_json::from_slice(&body).unwrap();
        assert!(parsed.valid);
    }

    #[tokio::test]
    async fn agent_ws_requires_identity_params() {
        let state = test_state(Arc::new(MemStore::new())).await;
        let response = router(state)
            .oneshot(Request::get("/api/v1/agent/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
