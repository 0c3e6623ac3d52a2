//! Typed inbound messages.

use serde_json::{Map, Value};
use statelink_core::protocol::{MessageType, PreferencesPatch};
use statelink_core::ClientId;

/// A validated client message.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// Run an allow-listed host command.
    Command(CommandRequest),
    /// Update this client's preferences.
    ClientConfig {
        /// Correlation id.
        id: Option<String>,
        /// Requested changes.
        update: ClientConfigUpdate,
    },
    /// Send this client a fresh full snapshot.
    RequestState {
        /// Correlation id.
        id: Option<String>,
    },
    /// Ask for server status.
    Status {
        /// Correlation id.
        id: Option<String>,
    },
    /// A `fileSystem`, `git`, `prompt` or `config` operation.
    Operation(OperationRequest),
}

impl InboundMessage {
    /// Correlation id of the message, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Command(req) => req.id.as_deref(),
            Self::Operation(req) => req.id.as_deref(),
            Self::ClientConfig { id, .. } | Self::RequestState { id } | Self::Status { id } => {
                id.as_deref()
            }
        }
    }

    /// Short label used for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::ClientConfig { .. } => "clientConfig",
            Self::RequestState { .. } => "requestState",
            Self::Status { .. } => "status",
            Self::Operation(req) => req.kind.as_str(),
        }
    }
}

/// `{"type":"command","id":..,"command":..,"args":[..]}`
#[derive(Clone, Debug, PartialEq)]
pub struct CommandRequest {
    /// Correlation id.
    pub id: Option<String>,
    /// Host command name.
    pub command: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// Preference change carried by a `clientConfig` broadcast.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientConfigUpdate {
    /// Filter and throttle changes.
    pub preferences: PreferencesPatch,
    /// Switch between deltas and full values.
    pub incremental_updates: Option<bool>,
}

/// A nested operation for one of the operation-carrying message types.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationRequest {
    /// Correlation id.
    pub id: Option<String>,
    /// Envelope type.
    pub kind: MessageType,
    /// Operation name from `data.operation`.
    pub operation: String,
    /// Full `data` object, `operation` included.
    pub data: Map<String, Value>,
    /// Client that sent the request. Filled in by the router.
    pub client_id: Option<ClientId>,
}

impl OperationRequest {
    /// Registry key, `"<type>.<operation>"`.
    pub fn key(&self) -> String {
        operation_key(self.kind, &self.operation)
    }
}

/// Registry key for an operation.
pub fn operation_key(kind: MessageType, operation: &str) -> String {
    format!("{}.{operation}", kind.as_str())
}
