//! End-to-end tests against a real server on an ephemeral port.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use statelink_core::host::{CommandExecutor, ExecutionError, InMemoryHost, StaticAllowlist};
use statelink_core::{ClientId, StateChangeKind};
use statelink_rpc::OperationRegistry;
use statelink_server::{Collaborators, ServerConfig, SyncServer};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Default)]
struct RecordingExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "command": command, "argc": args.len() }))
    }
}

struct TestServer {
    url: String,
    server: Arc<SyncServer>,
    host: Arc<InMemoryHost>,
    executor: Arc<RecordingExecutor>,
}

impl TestServer {
    async fn boot(config: ServerConfig) -> Self {
        let host = Arc::new(InMemoryHost::new());
        host.apply(StateChangeKind::ActiveEditor, json!({ "path": "src/main.rs" }));
        let executor = Arc::new(RecordingExecutor::default());
        let server = Arc::new(SyncServer::new(
            config,
            Collaborators {
                host: host.clone(),
                executor: executor.clone(),
                allowlist: Arc::new(StaticAllowlist::new(["editor.*"])),
            },
            OperationRegistry::new(),
        ));
        let (addr, _handle) = server.listen().await.unwrap();
        Self {
            url: format!("ws://{addr}/ws"),
            server,
            host,
            executor,
        }
    }

    async fn connect(&self) -> WsStream {
        let (ws, _) = connect_async(self.url.as_str()).await.unwrap();
        ws
    }

    async fn connect_with_origin(&self, origin: &'static str) -> WsStream {
        let mut request = self.url.as_str().into_client_request().unwrap();
        let _ = request.headers_mut().insert("Origin", HeaderValue::from_static(origin));
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        settle_delay: Duration::from_millis(20),
        ..ServerConfig::default()
    }
}

/// Next frame that is not a ping or pong.
async fn next_frame(ws: &mut WsStream) -> Message {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        if let Message::Text(text) = next_frame(ws).await {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn read_until(ws: &mut WsStream, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let v = read_json(ws).await;
        if pred(&v) {
            return v;
        }
    }
}

async fn expect_close_code(ws: &mut WsStream) -> u16 {
    match next_frame(ws).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// Read the welcome and hydration snapshot; returns the client id.
async fn handshake(ws: &mut WsStream) -> String {
    let welcome = read_json(ws).await;
    assert_eq!(welcome["type"], "status");
    assert_eq!(welcome["data"]["event"], "connected");
    let _snapshot = read_until(ws, |v| v["type"] == "broadcast" && v["data"]["changeType"] == "fullState").await;
    welcome["data"]["clientId"].as_str().unwrap().to_owned()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn welcome_then_hydration_snapshot() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;

    let welcome = read_json(&mut ws).await;
    assert_eq!(welcome["type"], "status");
    assert_eq!(welcome["data"]["event"], "connected");
    assert_eq!(welcome["data"]["resumed"], false);
    assert_eq!(welcome["data"]["stateVersion"], 0);
    assert!(welcome["data"]["clientId"].is_string());

    let snapshot = read_json(&mut ws).await;
    assert_eq!(snapshot["type"], "broadcast");
    assert_eq!(snapshot["data"]["changeType"], "fullState");
    assert_eq!(snapshot["data"]["incremental"], false);
    assert_eq!(snapshot["data"]["data"]["activeEditor"]["path"], "src/main.rs");

    t.server.dispose().await;
}

#[tokio::test]
async fn third_client_refused_when_capacity_is_two() {
    let t = TestServer::boot(ServerConfig {
        max_connections: 2,
        ..config()
    })
    .await;
    let mut a = t.connect().await;
    let _ = handshake(&mut a).await;
    let mut b = t.connect().await;
    let _ = handshake(&mut b).await;

    let mut c = t.connect().await;
    assert_eq!(expect_close_code(&mut c).await, 1008);
    assert_eq!(t.server.registry().len(), 2);

    t.server.dispose().await;
}

#[tokio::test]
async fn origin_allowlist_with_wildcard_domain() {
    let t = TestServer::boot(ServerConfig {
        allowed_origins: vec!["*.example.com".into()],
        ..config()
    })
    .await;

    let mut evil = t.connect_with_origin("https://evil.example").await;
    assert_eq!(expect_close_code(&mut evil).await, 1008);

    let mut good = t.connect_with_origin("https://sub.example.com").await;
    let _ = handshake(&mut good).await;
    assert_eq!(t.server.registry().len(), 1);

    t.server.dispose().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn disallowed_command_is_rejected() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let _ = handshake(&mut ws).await;

    ws.send(Message::text(r#"{"type":"command","id":"42","command":"not.allowed"}"#))
        .await
        .unwrap();
    let resp = read_until(&mut ws, |v| v["type"] == "response").await;
    assert_eq!(resp["id"], "42");
    assert!(resp["error"].as_str().unwrap().starts_with("Command validation failed: "));
    assert_eq!(t.executor.calls.load(Ordering::SeqCst), 0);

    ws.send(Message::text(r#"{"type":"command","id":"43","command":"editor.save","args":[1,2]}"#))
        .await
        .unwrap();
    let resp = read_until(&mut ws, |v| v["type"] == "response").await;
    assert_eq!(resp["id"], "43");
    assert_eq!(resp["data"]["argc"], 2);
    assert_eq!(t.executor.calls.load(Ordering::SeqCst), 1);

    t.server.dispose().await;
}

#[tokio::test]
async fn malformed_message_keeps_connection_open() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let _ = handshake(&mut ws).await;

    ws.send(Message::text("{nope")).await.unwrap();
    let resp = read_until(&mut ws, |v| v["type"] == "response").await;
    assert!(resp["error"].as_str().unwrap().contains("Invalid JSON"));

    ws.send(Message::text(r#"{"type":"status","id":"s1"}"#)).await.unwrap();
    let resp = read_until(&mut ws, |v| v["type"] == "response").await;
    assert_eq!(resp["id"], "s1");
    assert_eq!(resp["data"]["connections"], 1);

    t.server.dispose().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcasting
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn host_change_is_delivered_with_version() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let _ = handshake(&mut ws).await;

    t.host.apply(StateChangeKind::Selection, json!({ "line": 12 }));
    let msg = read_until(&mut ws, |v| v["type"] == "broadcast").await;
    assert_eq!(msg["data"]["changeType"], "selection");
    assert_eq!(msg["data"]["stateVersion"], 1);
    assert_eq!(msg["data"]["incremental"], true);
    assert_eq!(msg["data"]["data"]["line"], 12);
    assert!(msg["data"]["timestamp"].is_string());

    t.server.dispose().await;
}

#[tokio::test]
async fn client_config_filters_later_updates() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let _ = handshake(&mut ws).await;

    ws.send(Message::text(
        r#"{"type":"broadcast","id":"cfg","data":{"type":"clientConfig","config":{"statePreferences":{"includeSelectionChanges":false}}}}"#,
    ))
    .await
    .unwrap();
    let ack = read_until(&mut ws, |v| v["type"] == "response").await;
    assert_eq!(ack["id"], "cfg");
    assert_eq!(ack["data"]["statePreferences"]["includeSelectionChanges"], false);

    t.host.apply(StateChangeKind::Selection, json!({ "line": 1 }));
    t.host.apply(StateChangeKind::ActiveEditor, json!({ "path": "lib.rs" }));
    let msg = read_until(&mut ws, |v| v["type"] == "broadcast").await;
    assert_eq!(msg["data"]["changeType"], "activeEditor");
    assert_eq!(msg["data"]["stateVersion"], 2);

    t.server.dispose().await;
}

#[tokio::test]
async fn repeated_resync_sends_increasing_versions() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let _ = handshake(&mut ws).await;

    let _ = t.server.resync();
    let _ = t.server.resync();
    let first = read_until(&mut ws, |v| v["type"] == "broadcast").await;
    let second = read_until(&mut ws, |v| v["type"] == "broadcast").await;
    assert_eq!(first["data"]["changeType"], "fullState");
    assert_eq!(second["data"]["changeType"], "fullState");
    assert!(second["data"]["stateVersion"].as_u64() > first["data"]["stateVersion"].as_u64());

    t.server.dispose().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Disconnects and recovery
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn normal_close_removes_connection() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let id = ClientId::from(handshake(&mut ws).await);

    ws.close(None).await.unwrap();
    let registry = t.server.registry().clone();
    wait_for(|| registry.is_empty()).await;
    assert!(!t.server.recovery().is_recovering(&id));

    t.server.dispose().await;
}

#[tokio::test]
async fn dropped_client_resumes_and_peers_are_told() {
    let mut cfg = config();
    cfg.backoff.initial_delay_ms = 10_000;
    cfg.backoff.jitter_enabled = false;
    let t = TestServer::boot(cfg).await;

    let mut observer = t.connect().await;
    let _ = handshake(&mut observer).await;
    let mut ws = t.connect().await;
    let id = handshake(&mut ws).await;
    let client_id = ClientId::from(id.as_str());

    drop(ws);
    let recovery = t.server.recovery().clone();
    wait_for(|| recovery.is_recovering(&client_id)).await;
    assert_eq!(t.server.registry().len(), 2);

    let (mut resumed, _) = connect_async(format!("{}?resume={id}", t.url)).await.unwrap();
    let welcome = read_json(&mut resumed).await;
    assert_eq!(welcome["data"]["clientId"], id.as_str());
    assert_eq!(welcome["data"]["resumed"], true);

    let notice = read_until(&mut observer, |v| v["type"] == "status").await;
    assert_eq!(notice["data"]["event"], "clientRecovered");
    assert_eq!(notice["data"]["clientId"], id.as_str());
    assert_eq!(notice["data"]["attempts"], 1);

    wait_for(|| !recovery.is_recovering(&client_id)).await;
    assert_eq!(t.server.registry().len(), 2);

    t.server.dispose().await;
}

#[tokio::test]
async fn unknown_resume_id_gets_fresh_connection() {
    let t = TestServer::boot(config()).await;
    let (mut ws, _) = connect_async(format!("{}?resume=client_missing", t.url)).await.unwrap();
    let welcome = read_json(&mut ws).await;
    assert_eq!(welcome["data"]["resumed"], false);
    assert_ne!(welcome["data"]["clientId"], "client_missing");

    t.server.dispose().await;
}

#[tokio::test]
async fn dispose_closes_sessions_with_going_away() {
    let t = TestServer::boot(config()).await;
    let mut ws = t.connect().await;
    let _ = handshake(&mut ws).await;

    t.server.dispose().await;
    assert_eq!(expect_close_code(&mut ws).await, 1001);
    assert!(t.server.registry().is_empty());
}
