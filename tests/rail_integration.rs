//! End-to-end coverage over a live listener.
//!
//! Spins up a real `RailCore` + axum router bound to an ephemeral port and
//! drives it the way a connecting agent would: the WebSocket join
//! protocol, HMAC authentication, reconnect tokens, broadcast fan-out, and
//! the trace/synthesize round trip. Each test gets its own temp data
//! directory and port so they can run concurrently.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use resonance_rail::config::AppConfig;
use resonance_rail::{RailCore, listener, server};
use serde_json::{Value, json};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;
type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A running instance bound to an ephemeral port, torn down when the
/// backing temp directory is dropped.
struct TestServer {
    addr: SocketAddr,
    core: Arc<RailCore>,
    _dir: TempDir,
}

/// Builds and serves a fresh instance with auth disabled by default;
/// `configure` can override anything before the database is opened.
async fn spawn_test_server(configure: impl FnOnce(&mut AppConfig)) -> TestServer {
    let dir = tempfile::tempdir().expect("failed to create temp data dir");
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.server.port = 0;
    config.auth.auth_required = false;
    configure(&mut config);

    let state = server::build(config).await.expect("failed to build server state");
    server::spawn_background_tasks(&state);
    let (tcp_listener, addr) = server::bind(&state.config).await.expect("failed to bind listener");
    let core = Arc::clone(&state.core);
    let router = listener::build_router(state);
    tokio::spawn(async move {
        axum::serve(tcp_listener, router).await.expect("server task failed");
    });

    TestServer { addr, core, _dir: dir }
}

async fn ws_connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/ws");
    let (stream, _response) = tokio_tungstenite::connect_async(url).await.expect("failed to open websocket");
    stream
}

fn join_frame(agent_id: &str, extra_payload: Value) -> String {
    let mut payload = json!({ "agentId": agent_id });
    if let (Value::Object(target), Value::Object(extra)) = (&mut payload, &extra_payload) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    envelope("join", Some(agent_id), payload)
}

fn envelope(message_type: &str, agent_id: Option<&str>, payload: Value) -> String {
    json!({
        "id": Uuid::new_v4(),
        "type": message_type,
        "agentId": agent_id,
        "timestamp": Utc::now().timestamp_millis(),
        "payload": payload,
    })
    .to_string()
}

async fn send_text(stream: &mut WsStream, text: String) {
    stream.send(WsMessage::Text(text.into())).await.expect("failed to send frame");
}

async fn recv_json(stream: &mut WsStream) -> Value {
    loop {
        let msg = stream.next().await.expect("stream ended before a frame arrived").expect("websocket transport error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text.to_string()).expect("frame was not valid JSON");
        }
    }
}

/// Reads frames until one satisfies `predicate`, skipping unrelated
/// broadcasts (e.g. another client's `agent_joined` event).
async fn recv_matching(stream: &mut WsStream, predicate: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let value = recv_json(stream).await;
            if predicate(&value) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for a matching frame")
}

#[tokio::test]
async fn health_endpoint_reports_ok_with_no_connections() {
    let server = spawn_test_server(|_| {}).await;
    let client = reqwest::Client::new();
    let response = client.get(format!("http://{}/health", server.addr)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], json!(0));
}

#[tokio::test]
async fn websocket_join_without_auth_receives_sync_frame_and_reconnect_token() {
    let server = spawn_test_server(|_| {}).await;
    let mut ws = ws_connect(server.addr).await;
    send_text(&mut ws, join_frame("agent-open", json!({}))).await;

    let sync = recv_json(&mut ws).await;
    assert_eq!(sync["type"], "sync");
    assert!(sync["payload"]["reconnectToken"].is_string());
    assert_eq!(sync["payload"]["agents"], json!(["agent-open"]));
}

#[tokio::test]
async fn hmac_auth_join_succeeds_with_a_valid_signature() {
    let server = spawn_test_server(|c| {
        c.auth.auth_required = true;
        c.auth.admin_secret = "rail-admin-secret".to_string();
    })
    .await;

    let client = reqwest::Client::new();
    let enroll_response = client
        .post(format!("http://{}/enroll", server.addr))
        .bearer_auth("rail-admin-secret")
        .json(&json!({ "agentId": "agent-hmac" }))
        .send()
        .await
        .unwrap();
    assert_eq!(enroll_response.status(), 200);
    let enrolled: Value = enroll_response.json().await.unwrap();
    let secret = hex::decode(enrolled["secret"].as_str().unwrap()).unwrap();

    let timestamp = Utc::now().timestamp_millis();
    let nonce = "join-nonce-1";
    let signing_payload = format!("agent-hmac:{timestamp}:{nonce}");
    let mut mac = HmacSha256::new_from_slice(&secret).unwrap();
    mac.update(signing_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let auth_token = json!({
        "agentId": "agent-hmac",
        "timestamp": timestamp,
        "nonce": nonce,
        "signature": signature,
    });

    let mut ws = ws_connect(server.addr).await;
    send_text(&mut ws, join_frame("agent-hmac", json!({ "authToken": auth_token }))).await;
    let sync = recv_json(&mut ws).await;
    assert_eq!(sync["type"], "sync");
}

#[tokio::test]
async fn hmac_auth_join_rejected_with_a_bad_signature() {
    let server = spawn_test_server(|c| {
        c.auth.auth_required = true;
        c.auth.admin_secret = "rail-admin-secret".to_string();
    })
    .await;

    let client = reqwest::Client::new();
    client
        .post(format!("http://{}/enroll", server.addr))
        .bearer_auth("rail-admin-secret")
        .json(&json!({ "agentId": "agent-forged" }))
        .send()
        .await
        .unwrap();

    let auth_token = json!({
        "agentId": "agent-forged",
        "timestamp": Utc::now().timestamp_millis(),
        "nonce": "n",
        "signature": "0000",
    });

    let mut ws = ws_connect(server.addr).await;
    send_text(&mut ws, join_frame("agent-forged", json!({ "authToken": auth_token }))).await;
    let close = ws.next().await.expect("stream ended without a close frame").expect("websocket transport error");
    match close {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, 1008u16.into()),
        other => panic!("expected a policy-violation close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_token_allows_rejoin_after_disconnect() {
    let server = spawn_test_server(|_| {}).await;
    let mut ws = ws_connect(server.addr).await;
    send_text(&mut ws, join_frame("agent-reconnect", json!({}))).await;
    let sync = recv_json(&mut ws).await;
    let reconnect_token = sync["payload"]["reconnectToken"].as_str().unwrap().to_string();
    ws.close(None).await.ok();

    let mut ws2 = ws_connect(server.addr).await;
    send_text(&mut ws2, join_frame("agent-reconnect", json!({ "reconnectToken": reconnect_token }))).await;
    let sync2 = recv_json(&mut ws2).await;
    assert_eq!(sync2["type"], "sync");
}

#[tokio::test]
async fn broadcast_fanout_reaches_other_connected_clients() {
    let server = spawn_test_server(|_| {}).await;

    let mut a = ws_connect(server.addr).await;
    send_text(&mut a, join_frame("agent-bcast-a", json!({}))).await;
    recv_json(&mut a).await;

    let mut b = ws_connect(server.addr).await;
    send_text(&mut b, join_frame("agent-bcast-b", json!({}))).await;
    recv_json(&mut b).await;

    send_text(
        &mut a,
        envelope("broadcast", Some("agent-bcast-a"), json!({ "note": "hello from a" })),
    )
    .await;

    let received = recv_matching(&mut b, |v| v["payload"]["note"] == "hello from a").await;
    assert_eq!(received["type"], "broadcast");
}

#[tokio::test]
async fn trace_then_synthesize_returns_the_persisted_trace() {
    let server = spawn_test_server(|_| {}).await;
    let mut ws = ws_connect(server.addr).await;
    send_text(&mut ws, join_frame("agent-trace", json!({}))).await;
    recv_json(&mut ws).await;

    send_text(
        &mut ws,
        envelope(
            "trace",
            Some("agent-trace"),
            json!({
                "content": "weighed three routing strategies before picking thermodynamic sampling",
                "kind": "reasoning",
                "embedding": [0.1, 0.2, 0.3],
            }),
        ),
    )
    .await;

    // persistence is fire-and-forget; give the write a moment to land
    tokio::time::sleep(Duration::from_millis(50)).await;

    send_text(
        &mut ws,
        envelope("synthesize", Some("agent-trace"), json!({ "embedding": [0.1, 0.2, 0.3], "limit": 5 })),
    )
    .await;

    let result = recv_matching(&mut ws, |v| v["type"] == "synthesize").await;
    assert_eq!(result["payload"]["count"], json!(1));
}

#[tokio::test]
async fn pause_and_resume_replay_queued_coherence_updates() {
    let server = spawn_test_server(|_| {}).await;
    let mut ws = ws_connect(server.addr).await;
    send_text(&mut ws, join_frame("agent-pause", json!({}))).await;
    recv_json(&mut ws).await;

    server.core.pause().await;
    assert!(server.core.is_paused());

    send_text(&mut ws, envelope("coherence", Some("agent-pause"), json!({ "phase": 1.5 }))).await;

    server.core.resume().await;
    assert!(!server.core.is_paused());
}
