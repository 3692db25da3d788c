//! C11: WebSocket listener and HTTP admin surface.
//!
//! Owns sockets; the Rail Core owns logical clients. The link between
//! them is `ClientId`, a value passed across the boundary per the
//! source's "cyclic lifetime... the link is by clientId (a value, not
//! a reference)" design note — this module never holds a reference
//! into `RailCore`'s client table and `RailCore` never holds a socket.

use crate::auth_protocol::AuthRegistry;
use crate::config::AppConfig;
use crate::domain_types::{AgentId, AgentName};
use crate::error::RailError;
use crate::message::{AuthToken, Message as RailMessage, MessageType};
use crate::rail_core::{ClientId, JoinRequest, Outbound, ProcessOutcome, RailCore};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// WebSocket close codes used throughout the listener, named per the
/// external interfaces table.
mod close_code {
    pub const SERVER_SHUTTING_DOWN: u16 = 1001;
    pub const PROTOCOL_VIOLATION: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const OVERLOAD: u16 = 1013;
}

/// Maps a `RailError` surfaced during join handling to the wire-level
/// close code a rejected client sees. No component error is ever sent as
/// a reason string — only this numeric code.
#[must_use]
pub fn close_code_for(error: &RailError) -> u16 {
    match error {
        RailError::Auth(_) | RailError::RateLimit(_) => close_code::POLICY_VIOLATION,
        RailError::Absorption(_) => close_code::PROTOCOL_VIOLATION,
        RailError::Router(_) | RailError::Kuramoto(_) | RailError::Config(_) | RailError::Firewall(_) => {
            close_code::INVALID_PAYLOAD
        }
        RailError::Storage(_) | RailError::Io(_) => close_code::OVERLOAD,
    }
}

/// Shared application state for both the WebSocket and HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<RailCore>,
    pub config: Arc<AppConfig>,
    pub metrics_handle: Arc<metrics_exporter_prometheus::PrometheusHandle>,
    connections: Arc<AtomicUsize>,
    observers: Arc<AtomicUsize>,
}

impl AppState {
    #[must_use]
    pub fn new(core: Arc<RailCore>, config: Arc<AppConfig>, metrics_handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        Self {
            core,
            config,
            metrics_handle: Arc::new(metrics_handle),
            connections: Arc::new(AtomicUsize::new(0)),
            observers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Currently connected observer ("external agent") count, for the
    /// metadata broadcaster's `externalAgentCount` field.
    #[must_use]
    pub fn observer_count(&self) -> u32 {
        u32::try_from(self.observers.load(Ordering::SeqCst)).unwrap_or(u32::MAX)
    }

    /// Currently open socket count, across observers and full clients.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Builds the shared axum `Router`, mounting the WebSocket upgrade route
/// and the HTTP admin surface on the same port, with CORS restricted to
/// the configured allow-list.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.server.cors_allowed_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> =
            state.config.server.cors_allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_endpoint))
        .route("/agents", get(agents))
        .route("/enroll", post(enroll))
        .route("/.well-known/resonance-rail", get(discovery))
        .layer(cors)
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The payload shape expected in a `join` frame. `authToken`/
/// `reconnectToken` cover every agent this rail actually serves; a JWT
/// path for browser clients is left out since nothing in this crate's
/// scope names an issuer, audience, or signing algorithm to verify
/// against, and HMAC/reconnect-token auth already covers join
/// admission end to end.
#[derive(serde::Deserialize)]
struct JoinPayload {
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(rename = "agentName")]
    agent_name: Option<String>,
    platform: Option<String>,
    #[serde(rename = "authToken")]
    auth_token: Option<AuthToken>,
    #[serde(rename = "reconnectToken")]
    reconnect_token: Option<String>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some(Ok(WsMessage::Text(first))) = receiver.next().await else {
        let _ = sender.send(WsMessage::Close(None)).await;
        return;
    };

    let Ok(first_message) = serde_json::from_str::<RailMessage>(&first) else {
        close_with(&mut sender, close_code::INVALID_PAYLOAD).await;
        return;
    };

    if first_message.message_type != MessageType::Join {
        close_with(&mut sender, close_code::PROTOCOL_VIOLATION).await;
        return;
    }

    let Ok(join_payload) = serde_json::from_value::<JoinPayload>(first_message.payload) else {
        close_with(&mut sender, close_code::INVALID_PAYLOAD).await;
        return;
    };

    let is_observer = state.core.auth().is_observer_platform(join_payload.platform.as_deref().unwrap_or_default());

    if is_observer {
        if state.observers.load(Ordering::SeqCst) >= state.config.server.max_observers {
            close_with(&mut sender, close_code::OVERLOAD).await;
            return;
        }
    } else if state.connections.load(Ordering::SeqCst) >= state.config.server.max_connections {
        close_with(&mut sender, close_code::OVERLOAD).await;
        return;
    }

    let Ok(agent_id) = AgentId::try_new(join_payload.agent_id) else {
        close_with(&mut sender, close_code::INVALID_PAYLOAD).await;
        return;
    };
    let agent_name = join_payload.agent_name.and_then(|n| AgentName::try_new(n).ok());
    let client_id = ClientId::new(is_observer);

    let req = JoinRequest {
        client_id,
        agent_id,
        agent_name,
        platform: join_payload.platform,
        auth_token: join_payload.auth_token,
        reconnect_token: join_payload.reconnect_token,
        is_observer,
    };

    let outcome = match state.core.handle_join(req).await {
        Ok(o) => o,
        Err(e) => {
            close_with(&mut sender, close_code_for(&e)).await;
            return;
        }
    };

    if is_observer {
        state.observers.fetch_add(1, Ordering::SeqCst);
    } else {
        state.connections.fetch_add(1, Ordering::SeqCst);
    }

    let sync_payload = json!({
        "clientId": outcome.client_id.to_string(),
        "coherence": outcome.coherence.into_inner(),
        "agents": outcome.agents,
        "reconnectToken": outcome.reconnect_token,
    });
    let sync_frame = RailMessage::new(MessageType::Sync, Some(outcome.agent_id.clone()), sync_payload);
    if send_frame(&mut sender, &sync_frame).await.is_err() {
        cleanup(&state, client_id, is_observer).await;
        return;
    }

    let mut outbound_rx = state.core.subscribe();
    let heartbeat_interval = Duration::from_millis(state.config.server.heartbeat_interval_ms);
    let mut heartbeat_ticker = tokio::time::interval(heartbeat_interval);
    let mut alive = true;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        alive = true;
                        match serde_json::from_str::<RailMessage>(&text) {
                            Ok(msg) => {
                                if state.core.process_message(client_id, msg).await == ProcessOutcome::RateLimited {
                                    close_with(&mut sender, close_code::POLICY_VIOLATION).await;
                                    break;
                                }
                            }
                            Err(_) => {
                                close_with(&mut sender, close_code::INVALID_PAYLOAD).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_) | WsMessage::Ping(_))) => {
                        alive = true;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket transport error");
                        break;
                    }
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Ok(Outbound::Broadcast(frame)) => {
                        let shutting_down =
                            frame.payload.get("event").and_then(serde_json::Value::as_str) == Some("server_shutdown");
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                        if shutting_down {
                            close_with(&mut sender, close_code::SERVER_SHUTTING_DOWN).await;
                            break;
                        }
                    }
                    Ok(Outbound::Unicast(target, frame)) if target == client_id => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Outbound::Unicast(_, _)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "outbound broadcast receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat_ticker.tick() => {
                if !alive {
                    break;
                }
                alive = false;
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup(&state, client_id, is_observer).await;
}

async fn cleanup(state: &AppState, client_id: ClientId, is_observer: bool) {
    state.core.disconnect(client_id).await;
    if is_observer {
        state.observers.fetch_sub(1, Ordering::SeqCst);
    } else {
        state.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn close_with(sender: &mut futures::stream::SplitSink<WebSocket, WsMessage>, code: u16) {
    let _ = sender
        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame { code, reason: String::new().into() })))
        .await;
}

async fn send_frame(
    sender: &mut futures::stream::SplitSink<WebSocket, WsMessage>,
    frame: &RailMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    sender.send(WsMessage::Text(text.into())).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.core.client_count(),
        "paused": state.core.is_paused(),
        "messagesProcessed": state.core.messages_processed(),
    }))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "connections": state.core.client_count(),
        "agents": state.core.connected_agent_ids(),
        "paused": state.core.is_paused(),
        "messagesProcessed": state.core.messages_processed(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}

async fn agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "agents": state.core.connected_agent_ids() }))
}

#[derive(serde::Deserialize)]
struct EnrollRequest {
    #[serde(rename = "agentId")]
    agent_id: String,
    secret: Option<String>,
}

async fn enroll(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<EnrollRequest>) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.config.auth.admin_secret);
    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected && !state.config.auth.admin_secret.is_empty());

    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }

    let Ok(agent_id) = AgentId::try_new(req.agent_id) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid agentId" }))).into_response();
    };

    let secret_hex = req.secret.unwrap_or_else(AuthRegistry::generate_secret);
    let Ok(secret_bytes) = hex::decode(&secret_hex) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "secret must be hex-encoded" }))).into_response();
    };

    state.core.auth().enroll(agent_id.clone(), secret_bytes);
    let secret_hash = hash_secret(&secret_hex);
    if let Err(e) =
        crate::storage::repository::upsert_enrollment(state.core.pool(), agent_id.to_string().as_str(), &secret_hash)
            .await
    {
        warn!(error = %e, "failed to persist enrollment");
    }

    info!(agent_id = %agent_id, "enrolled new agent");
    (StatusCode::OK, Json(json!({ "agentId": agent_id.to_string(), "secret": secret_hex }))).into_response()
}

/// One-way digest of a hex-encoded secret for the `rail_enrollments.secret_hash`
/// column. The secret itself never leaves `AuthRegistry`'s in-memory
/// registry; only this digest is persisted, per the data model's
/// `secretHash` field.
fn hash_secret(secret_hex: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(secret_hex.as_bytes());
    hex::encode(digest)
}

async fn discovery() -> impl IntoResponse {
    Json(json!({
        "service": "resonance-rail",
        "protocol": "ws",
        "messageTypes": [
            "join", "leave", "heartbeat", "coherence", "message", "broadcast",
            "sync", "migrate", "metadata", "trace", "search", "synthesize", "replay",
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, RailError};

    #[test]
    fn auth_errors_map_to_policy_violation() {
        assert_eq!(close_code_for(&RailError::Auth(AuthError::BadSignature)), close_code::POLICY_VIOLATION);
    }

    #[test]
    fn absorption_errors_map_to_protocol_violation() {
        let e = RailError::Absorption(crate::error::AbsorptionError::AlreadyConnected);
        assert_eq!(close_code_for(&e), close_code::PROTOCOL_VIOLATION);
    }
}
