//! Inbound message dispatch.
//!
//! Every text frame becomes exactly one response envelope. Decoding failures
//! and handler failures are turned into error responses that keep the
//! correlation id; nothing here closes the connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde_json::{Value, json};
use statelink_core::host::{Allowlist, CommandExecutor, ExecutionError};
use statelink_core::{ClientId, Envelope};
use statelink_rpc::registry::run_guarded;
use statelink_rpc::types::{ClientConfigUpdate, CommandRequest};
use statelink_rpc::validation::decode_message;
use statelink_rpc::{InboundMessage, OperationRegistry, RouterError};
use tracing::{debug, error, instrument, warn};

use crate::broadcast::StateBroadcaster;
use crate::metrics::{ROUTER_ERRORS_TOTAL, ROUTER_MESSAGES_TOTAL};
use crate::registry::ConnectionRegistry;

/// Routes decoded client messages to their handlers.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<StateBroadcaster>,
    operations: OperationRegistry,
    executor: Arc<dyn CommandExecutor>,
    allowlist: Arc<dyn Allowlist>,
    handler_timeout: Duration,
    start_time: Instant,
}

impl MessageRouter {
    /// Create a router.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<StateBroadcaster>,
        operations: OperationRegistry,
        executor: Arc<dyn CommandExecutor>,
        allowlist: Arc<dyn Allowlist>,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            operations,
            executor,
            allowlist,
            handler_timeout,
            start_time: Instant::now(),
        }
    }

    /// Registered operation keys, advertised in the welcome message.
    pub fn operations(&self) -> Vec<String> {
        self.operations.operations()
    }

    /// Handle one text frame from `client_id` and build its response.
    #[instrument(skip_all, fields(client_id = %client_id, message_type))]
    pub async fn handle(&self, client_id: &ClientId, text: &str) -> Envelope {
        let message = match decode_message(text) {
            Ok(m) => m,
            Err(rejection) => {
                counter!(ROUTER_MESSAGES_TOTAL, "type" => "invalid").increment(1);
                return self.failure("invalid", rejection.id, &rejection.error);
            }
        };

        let label = message.label();
        let _ = tracing::Span::current().record("message_type", label);
        counter!(ROUTER_MESSAGES_TOTAL, "type" => label).increment(1);

        let id = message.id().map(str::to_owned);
        debug!(id = id.as_deref(), "dispatching message");

        match run_guarded(label, self.handler_timeout, self.dispatch(client_id, message)).await {
            Ok(data) => Envelope::response(id, data),
            Err(err) => self.failure(label, id, &err),
        }
    }

    async fn dispatch(&self, client_id: &ClientId, message: InboundMessage) -> Result<Value, RouterError> {
        match message {
            InboundMessage::Command(request) => self.run_command(request).await,
            InboundMessage::ClientConfig { update, .. } => self.apply_client_config(client_id, &update),
            InboundMessage::RequestState { .. } => self.request_state(client_id),
            InboundMessage::Status { .. } => Ok(self.status()),
            InboundMessage::Operation(mut request) => {
                request.client_id = Some(client_id.clone());
                self.operations.dispatch(request).await
            }
        }
    }

    async fn run_command(&self, request: CommandRequest) -> Result<Value, RouterError> {
        if !self.allowlist.is_allowed(&request.command) {
            warn!(command = %request.command, "command rejected by allowlist");
            return Err(RouterError::validation(format!(
                "Command validation failed: '{}' is not an allowed command",
                request.command
            )));
        }

        self.executor
            .execute(&request.command, request.args)
            .await
            .map_err(|e| match e {
                ExecutionError::InvalidArguments(reason) => {
                    RouterError::validation(format!("Command validation failed: {reason}"))
                }
                ExecutionError::UnknownCommand(name) => RouterError::NotFound {
                    message: format!("Unknown command '{name}'"),
                },
                ExecutionError::Failed(reason) => {
                    RouterError::execution(format!("command '{}' failed: {reason}", request.command))
                }
            })
    }

    fn apply_client_config(&self, client_id: &ClientId, update: &ClientConfigUpdate) -> Result<Value, RouterError> {
        let conn = self
            .registry
            .lookup(client_id)
            .ok_or_else(|| RouterError::validation("Unknown client"))?;

        let preferences = conn.apply_preferences(&update.preferences);
        if let Some(enabled) = update.incremental_updates {
            conn.set_incremental_updates(enabled);
        }
        debug!(?preferences, incremental = conn.incremental_updates(), "client config updated");

        Ok(json!({
            "event": "clientConfigUpdated",
            "statePreferences": preferences,
            "incrementalUpdates": conn.incremental_updates(),
        }))
    }

    fn request_state(&self, client_id: &ClientId) -> Result<Value, RouterError> {
        match self.broadcaster.send_snapshot_to(client_id) {
            Some(version) => Ok(json!({ "event": "stateSent", "stateVersion": version })),
            None => Err(RouterError::execution("snapshot could not be queued")),
        }
    }

    fn status(&self) -> Value {
        json!({
            "stateVersion": self.broadcaster.current_version(),
            "connections": self.registry.connected_count(),
            "uptimeSecs": self.start_time.elapsed().as_secs(),
        })
    }

    fn failure(&self, label: &'static str, id: Option<String>, err: &RouterError) -> Envelope {
        counter!(ROUTER_ERRORS_TOTAL, "type" => label, "code" => err.code()).increment(1);
        match err {
            RouterError::Execution { message } => error!(message_type = label, error = %message, "handler failed"),
            _ => debug!(message_type = label, code = err.code(), error = %err, "message rejected"),
        }
        Envelope::error_response(id, err.client_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use statelink_core::StateVersion;
    use statelink_core::host::{InMemoryHost, StaticAllowlist};
    use statelink_core::protocol::{ClientPreferences, MessageType};
    use statelink_core::StateChangeKind;
    use statelink_rpc::{OperationHandler, OperationRequest};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::websocket::connection::ClientConnection;

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandExecutor for CountingExecutor {
        async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            match command {
                "editor.save" => Ok(json!({ "saved": true, "args": args })),
                "editor.fail" => Err(ExecutionError::Failed("disk on fire at /secret/path".into())),
                "editor.bad" => Err(ExecutionError::InvalidArguments("expected a path".into())),
                "editor.panic" => panic!("executor blew up"),
                other => Err(ExecutionError::UnknownCommand(other.into())),
            }
        }
    }

    struct EchoOperation;

    #[async_trait]
    impl OperationHandler for EchoOperation {
        async fn handle(&self, request: OperationRequest) -> Result<Value, RouterError> {
            Ok(json!({
                "operation": request.operation,
                "client": request.client_id.map(|c| c.to_string()),
            }))
        }
    }

    struct StuckOperation;

    #[async_trait]
    impl OperationHandler for StuckOperation {
        async fn handle(&self, _request: OperationRequest) -> Result<Value, RouterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    struct PanickingOperation;

    #[async_trait]
    impl OperationHandler for PanickingOperation {
        async fn handle(&self, _request: OperationRequest) -> Result<Value, RouterError> {
            panic!("prompt handler bug");
        }
    }

    struct Fixture {
        router: MessageRouter,
        executor: Arc<CountingExecutor>,
        host: Arc<InMemoryHost>,
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(
            4,
            vec!["*".into()],
            ClientPreferences::default(),
            true,
        ));
        let host = Arc::new(InMemoryHost::new());
        let broadcaster = Arc::new(StateBroadcaster::new(
            registry.clone(),
            Arc::new(StateVersion::new()),
            host.clone(),
            CancellationToken::new(),
        ));
        let mut operations = OperationRegistry::new();
        operations.register(MessageType::FileSystem, "read", EchoOperation);
        operations.register(MessageType::Git, "fetch", StuckOperation);
        operations.register(MessageType::Prompt, "show", PanickingOperation);
        let executor = Arc::new(CountingExecutor::default());
        let router = MessageRouter::new(
            registry.clone(),
            broadcaster,
            operations,
            executor.clone(),
            Arc::new(StaticAllowlist::new(["editor.*"])),
            Duration::from_secs(5),
        );
        let (tx, rx) = mpsc::channel(16);
        let conn = registry.admit(None, None, tx).unwrap().connection;
        Fixture {
            router,
            executor,
            host,
            conn,
            rx,
        }
    }

    fn to_value(envelope: &Envelope) -> Value {
        serde_json::from_str(&envelope.to_json().unwrap()).unwrap()
    }

    // ── Commands ──

    #[tokio::test]
    async fn disallowed_command_is_rejected_without_execution() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"command","id":"42","command":"not.allowed"}"#)
            .await;
        let v = to_value(&resp);
        assert_eq!(v["type"], "response");
        assert_eq!(v["id"], "42");
        assert!(v["error"].as_str().unwrap().starts_with("Command validation failed: "));
        assert_eq!(f.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allowed_command_returns_result() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"command","id":"1","command":"editor.save","args":["a.rs"]}"#)
            .await;
        let v = to_value(&resp);
        assert_eq!(v["id"], "1");
        assert_eq!(v["data"]["saved"], true);
        assert_eq!(v["data"]["args"][0], "a.rs");
        assert!(v.get("error").is_none());
    }

    #[tokio::test]
    async fn execution_failure_hides_details() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"command","id":"2","command":"editor.fail"}"#)
            .await;
        let v = to_value(&resp);
        assert_eq!(v["id"], "2");
        assert_eq!(v["error"], "Operation failed");
    }

    #[tokio::test]
    async fn invalid_arguments_are_a_validation_failure() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"command","id":"3","command":"editor.bad"}"#)
            .await;
        assert_eq!(to_value(&resp)["error"], "Command validation failed: expected a path");
    }

    #[tokio::test]
    async fn panicking_executor_becomes_error_response() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"command","id":"p","command":"editor.panic"}"#)
            .await;
        let v = to_value(&resp);
        assert_eq!(v["id"], "p");
        assert_eq!(v["error"], "Operation failed");

        let again = f
            .router
            .handle(&f.conn.id, r#"{"type":"command","id":"q","command":"editor.save"}"#)
            .await;
        assert!(again.error.is_none());
    }

    // ── Protocol errors ──

    #[tokio::test]
    async fn malformed_json_gets_inline_error() {
        let f = fixture();
        let resp = f.router.handle(&f.conn.id, "{not json").await;
        assert_eq!(resp.message_type, MessageType::Response);
        assert!(resp.id.is_none());
        assert!(resp.error.unwrap().starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn unknown_type_keeps_correlation_id() {
        let f = fixture();
        let resp = f.router.handle(&f.conn.id, r#"{"type":"bogus","id":"7"}"#).await;
        assert_eq!(resp.id.as_deref(), Some("7"));
        assert!(resp.error.is_some());
    }

    // ── Client config ──

    #[tokio::test]
    async fn client_config_updates_preferences_and_acks() {
        let f = fixture();
        let resp = f
            .router
            .handle(
                &f.conn.id,
                r#"{"type":"broadcast","id":"c","data":{"type":"clientConfig","config":{"statePreferences":{"includeDiagnostics":false,"throttleMs":250},"incrementalUpdates":false}}}"#,
            )
            .await;
        let v = to_value(&resp);
        assert_eq!(v["id"], "c");
        assert_eq!(v["data"]["statePreferences"]["includeDiagnostics"], false);
        assert_eq!(v["data"]["statePreferences"]["throttleMs"], 250);
        assert_eq!(v["data"]["incrementalUpdates"], false);

        let prefs = f.conn.preferences();
        assert!(!prefs.include_diagnostics);
        assert!(prefs.include_selection_changes);
        assert_eq!(prefs.throttle_ms, 250);
        assert!(!f.conn.incremental_updates());
    }

    // ── State and status ──

    #[tokio::test]
    async fn request_state_sends_snapshot_to_requester() {
        let mut f = fixture();
        f.host.apply(StateChangeKind::ActiveEditor, json!({ "path": "main.rs" }));
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"broadcast","id":"s","data":{"type":"requestState"}}"#)
            .await;
        assert_eq!(to_value(&resp)["data"]["stateVersion"], 0);

        let pushed: Value = serde_json::from_str(&f.rx.recv().await.unwrap()).unwrap();
        assert_eq!(pushed["type"], "broadcast");
        assert_eq!(pushed["data"]["incremental"], false);
        assert_eq!(pushed["data"]["data"]["activeEditor"]["path"], "main.rs");
    }

    #[tokio::test]
    async fn status_reports_version_and_connections() {
        let f = fixture();
        let resp = f.router.handle(&f.conn.id, r#"{"type":"status","id":"st"}"#).await;
        let v = to_value(&resp);
        assert_eq!(v["id"], "st");
        assert_eq!(v["data"]["stateVersion"], 0);
        assert_eq!(v["data"]["connections"], 1);
        assert!(v["data"]["uptimeSecs"].is_number());
    }

    // ── Operations ──

    #[tokio::test]
    async fn operation_dispatch_carries_client_id() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"fileSystem","id":"o","data":{"operation":"read","path":"x"}}"#)
            .await;
        let v = to_value(&resp);
        assert_eq!(v["data"]["operation"], "read");
        assert_eq!(v["data"]["client"], f.conn.id.as_str());
    }

    #[tokio::test]
    async fn unregistered_operation_is_not_found() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"git","id":"g","data":{"operation":"status"}}"#)
            .await;
        assert_eq!(resp.id.as_deref(), Some("g"));
        assert!(resp.error.unwrap().contains("git"));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_operation_times_out_at_router_budget() {
        let f = fixture();
        let started = tokio::time::Instant::now();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"git","id":"t","data":{"operation":"fetch"}}"#)
            .await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6), "{waited:?}");
        assert_eq!(resp.id.as_deref(), Some("t"));
        assert!(resp.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_operation_becomes_error_response() {
        let f = fixture();
        let resp = f
            .router
            .handle(&f.conn.id, r#"{"type":"prompt","id":"pp","data":{"operation":"show"}}"#)
            .await;
        assert_eq!(resp.id.as_deref(), Some("pp"));
        assert_eq!(resp.error.as_deref(), Some("Operation failed"));
    }

    #[tokio::test]
    async fn oversized_id_is_echoed_in_rejection() {
        let f = fixture();
        let long_id = "i".repeat(statelink_rpc::validation::MAX_ID_LENGTH + 1);
        let text = json!({"type": "command", "id": long_id, "command": "editor.save"}).to_string();
        let resp = f.router.handle(&f.conn.id, &text).await;
        assert_eq!(resp.id.as_deref(), Some(long_id.as_str()));
        assert!(resp.error.unwrap().contains("'id'"));
        assert_eq!(f.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn operations_are_listed() {
        let f = fixture();
        assert_eq!(f.router.operations(), vec!["fileSystem.read", "git.fetch", "prompt.show"]);
    }
}
