//! Demo collaborators backed by [`InMemoryHost`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use statelink_core::StateChangeKind;
use statelink_core::host::{CommandExecutor, ExecutionError, HostStateAccessor, InMemoryHost};
use statelink_rpc::{OperationHandler, OperationRequest, RouterError};
use statelink_settings::SyncSettings;

/// Commands understood by the demo host:
///
/// - `state.set [kind, data]`: record a change and publish it
/// - `state.get`: return the current snapshot
/// - `state.resync`: publish a full snapshot to every client
pub struct DemoExecutor {
    host: Arc<InMemoryHost>,
}

impl DemoExecutor {
    pub fn new(host: Arc<InMemoryHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl CommandExecutor for DemoExecutor {
    async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        match command {
            "state.set" => {
                let mut args = args.into_iter();
                let kind = args
                    .next()
                    .ok_or_else(|| ExecutionError::InvalidArguments("missing change kind".into()))?;
                let kind: StateChangeKind = serde_json::from_value(kind)
                    .map_err(|e| ExecutionError::InvalidArguments(format!("bad change kind: {e}")))?;
                if kind == StateChangeKind::FullState {
                    return Err(ExecutionError::InvalidArguments(
                        "use state.resync for full snapshots".into(),
                    ));
                }
                self.host.apply(kind, args.next().unwrap_or(Value::Null));
                Ok(json!({ "applied": kind.as_str() }))
            }
            "state.get" => Ok(self.host.current_state()),
            "state.resync" => {
                self.host.request_resync();
                Ok(json!({ "resync": true }))
            }
            other => Err(ExecutionError::UnknownCommand(other.to_owned())),
        }
    }
}

/// `config.get`: the effective settings, minus nothing sensitive.
pub struct ConfigGet {
    settings: Value,
}

impl ConfigGet {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            settings: serde_json::to_value(settings).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl OperationHandler for ConfigGet {
    async fn handle(&self, request: OperationRequest) -> Result<Value, RouterError> {
        match request.data.get("section").and_then(Value::as_str) {
            None => Ok(self.settings.clone()),
            Some(section) => self
                .settings
                .get(section)
                .cloned()
                .ok_or_else(|| RouterError::validation(format!("Unknown settings section '{section}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::Map;
    use statelink_core::protocol::MessageType;

    #[tokio::test]
    async fn set_updates_host_state() {
        let host = Arc::new(InMemoryHost::new());
        let mut rx = host.subscribe();
        let exec = DemoExecutor::new(host.clone());

        let out = exec
            .execute("state.set", vec![json!("selection"), json!({ "line": 3 })])
            .await
            .unwrap();
        assert_eq!(out["applied"], "selection");
        assert_eq!(host.current_state()["selection"]["line"], 3);
        assert_eq!(rx.recv().await.unwrap().kind, StateChangeKind::Selection);
    }

    #[tokio::test]
    async fn set_rejects_bad_kind() {
        let exec = DemoExecutor::new(Arc::new(InMemoryHost::new()));
        assert_matches!(
            exec.execute("state.set", vec![json!("nope")]).await,
            Err(ExecutionError::InvalidArguments(_))
        );
        assert_matches!(
            exec.execute("state.set", vec![]).await,
            Err(ExecutionError::InvalidArguments(_))
        );
        assert_matches!(
            exec.execute("state.set", vec![json!("fullState")]).await,
            Err(ExecutionError::InvalidArguments(_))
        );
    }

    #[tokio::test]
    async fn unknown_command() {
        let exec = DemoExecutor::new(Arc::new(InMemoryHost::new()));
        assert_matches!(
            exec.execute("rm.rf", vec![]).await,
            Err(ExecutionError::UnknownCommand(name)) if name == "rm.rf"
        );
    }

    fn config_request(section: Option<&str>) -> OperationRequest {
        let mut data = Map::new();
        let _ = data.insert("operation".into(), json!("get"));
        if let Some(s) = section {
            let _ = data.insert("section".into(), json!(s));
        }
        OperationRequest {
            id: None,
            kind: MessageType::Config,
            operation: "get".into(),
            data,
            client_id: None,
        }
    }

    #[tokio::test]
    async fn config_get_returns_section() {
        let handler = ConfigGet::new(&SyncSettings::default());
        let recovery = handler.handle(config_request(Some("recovery"))).await.unwrap();
        assert_eq!(recovery["maxRetries"], 5);
        assert!(handler.handle(config_request(None)).await.unwrap()["server"].is_object());
        assert_matches!(
            handler.handle(config_request(Some("missing"))).await,
            Err(RouterError::Validation { .. })
        );
    }
}
