//! Wire-format types for the client channel.
//!
//! Every frame in either direction is a JSON [`Envelope`]. State updates are
//! pushed as `broadcast` envelopes whose `data` is a [`StateBroadcast`].

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of envelope `type` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Client asks the host to run an allow-listed command.
    Command,
    /// Server reply correlated by `id`.
    Response,
    /// State push (server → client) or client configuration (client → server).
    Broadcast,
    /// Lifecycle notices and status queries.
    Status,
    /// Filesystem operation.
    FileSystem,
    /// Prompt operation.
    Prompt,
    /// Git operation.
    Git,
    /// Host configuration operation.
    Config,
}

impl MessageType {
    /// All wire names, in declaration order.
    pub const ALL: [MessageType; 8] = [
        Self::Command,
        Self::Response,
        Self::Broadcast,
        Self::Status,
        Self::FileSystem,
        Self::Prompt,
        Self::Git,
        Self::Config,
    ];

    /// Wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Broadcast => "broadcast",
            Self::Status => "status",
            Self::FileSystem => "fileSystem",
            Self::Prompt => "prompt",
            Self::Git => "git",
            Self::Config => "config",
        }
    }

    /// Look up a type by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether envelopes of this type carry a nested `operation` in `data`.
    pub fn carries_operation(self) -> bool {
        matches!(
            self,
            Self::FileSystem | Self::Prompt | Self::Git | Self::Config
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON envelope exchanged over the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Client-supplied correlation token, echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Command name (for `command` envelopes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Positional command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error text on failed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    fn bare(message_type: MessageType) -> Self {
        Self {
            message_type,
            id: None,
            command: None,
            args: None,
            data: None,
            error: None,
        }
    }

    /// Successful response carrying `data`.
    pub fn response(id: Option<String>, data: Value) -> Self {
        Self {
            id,
            data: Some(data),
            ..Self::bare(MessageType::Response)
        }
    }

    /// Failed response carrying a client-safe error message.
    pub fn error_response(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            ..Self::bare(MessageType::Response)
        }
    }

    /// Server status notice.
    pub fn status(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::bare(MessageType::Status)
        }
    }

    /// State push.
    pub fn broadcast(payload: &StateBroadcast) -> Self {
        Self {
            data: serde_json::to_value(payload).ok(),
            ..Self::bare(MessageType::Broadcast)
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Close codes
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket close status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure.
    pub const NORMAL: Self = Self(1000);
    /// Endpoint going away (page navigation, server shutdown).
    pub const GOING_AWAY: Self = Self(1001);
    /// No status code was present in the close frame.
    pub const NO_STATUS: Self = Self(1005);
    /// Connection dropped without a close frame.
    pub const ABNORMAL: Self = Self(1006);
    /// Capacity or origin refusal.
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// Router-level failure.
    pub const INTERNAL_ERROR: Self = Self(1011);

    /// Intentional closures never enter recovery.
    pub fn is_intentional(self) -> bool {
        matches!(self, Self::NORMAL | Self::GOING_AWAY | Self::NO_STATUS)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State changes
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of host state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateChangeKind {
    /// The focused editor changed.
    ActiveEditor,
    /// A document's contents changed.
    DocumentChange,
    /// Workspace folders were added or removed.
    WorkspaceFolders,
    /// The set of visible editors changed.
    VisibleEditors,
    /// Selection or cursor moved.
    Selection,
    /// Diagnostics were published.
    Diagnostics,
    /// Complete snapshot of host state.
    FullState,
}

impl StateChangeKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveEditor => "activeEditor",
            Self::DocumentChange => "documentChange",
            Self::WorkspaceFolders => "workspaceFolders",
            Self::VisibleEditors => "visibleEditors",
            Self::Selection => "selection",
            Self::Diagnostics => "diagnostics",
            Self::FullState => "fullState",
        }
    }

    /// Whether a client with these preferences wants this kind of update.
    pub fn passes(self, prefs: &ClientPreferences) -> bool {
        match self {
            Self::DocumentChange => prefs.include_document_changes,
            Self::Selection => prefs.include_selection_changes,
            Self::Diagnostics => prefs.include_diagnostics,
            Self::ActiveEditor | Self::WorkspaceFolders | Self::VisibleEditors | Self::FullState => {
                true
            }
        }
    }
}

impl fmt::Display for StateChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed change produced by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    /// What changed.
    #[serde(rename = "type")]
    pub kind: StateChangeKind,
    /// When the host observed the change.
    pub timestamp: DateTime<Utc>,
    /// Opaque payload.
    pub data: Value,
    /// Whether `data` is a delta rather than a complete value.
    pub incremental: bool,
}

impl StateChangeEvent {
    /// An incremental change of the given kind, timestamped now.
    pub fn incremental(kind: StateChangeKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
            incremental: true,
        }
    }

    /// A full snapshot that bypasses filters and throttles.
    pub fn full_snapshot(data: Value) -> Self {
        Self {
            kind: StateChangeKind::FullState,
            timestamp: Utc::now(),
            data,
            incremental: false,
        }
    }

    /// Whether this event is the full-snapshot marker.
    pub fn is_full_snapshot(&self) -> bool {
        !self.incremental && self.kind == StateChangeKind::FullState
    }
}

/// Payload of an outbound state push.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateBroadcast {
    /// Kind of change.
    pub change_type: StateChangeKind,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// Global state version captured for this message.
    pub state_version: u64,
    /// Change payload.
    pub data: Value,
    /// Whether `data` is a delta.
    pub incremental: bool,
}

impl StateBroadcast {
    /// Build the outbound payload for `event` stamped with `state_version`.
    pub fn from_event(event: &StateChangeEvent, state_version: u64) -> Self {
        Self {
            change_type: event.kind,
            timestamp: event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            state_version,
            data: event.data.clone(),
            incremental: event.incremental,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client preferences
// ─────────────────────────────────────────────────────────────────────────────

/// Per-client filtering and throttling preferences.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPreferences {
    /// Receive `documentChange` updates.
    pub include_document_changes: bool,
    /// Receive `selection` updates.
    pub include_selection_changes: bool,
    /// Receive `diagnostics` updates.
    pub include_diagnostics: bool,
    /// Coalescing window per change kind, in milliseconds.
    pub throttle_ms: u64,
}

impl Default for ClientPreferences {
    fn default() -> Self {
        Self {
            include_document_changes: true,
            include_selection_changes: true,
            include_diagnostics: true,
            throttle_ms: 100,
        }
    }
}

/// Partial preference update sent by a client; absent fields are unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    /// New `include_document_changes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_document_changes: Option<bool>,
    /// New `include_selection_changes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_selection_changes: Option<bool>,
    /// New `include_diagnostics`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_diagnostics: Option<bool>,
    /// New `throttle_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_ms: Option<u64>,
}

impl ClientPreferences {
    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &PreferencesPatch) {
        if let Some(v) = patch.include_document_changes {
            self.include_document_changes = v;
        }
        if let Some(v) = patch.include_selection_changes {
            self.include_selection_changes = v;
        }
        if let Some(v) = patch.include_diagnostics {
            self.include_diagnostics = v;
        }
        if let Some(v) = patch.throttle_ms {
            self.throttle_ms = v;
        }
    }
}
