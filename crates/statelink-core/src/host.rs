//! Host application collaborators.
//!
//! The sync core never owns host state. It reads snapshots and receives
//! change events through [`HostStateAccessor`], runs client commands through
//! a [`CommandExecutor`], and asks an [`Allowlist`] before doing so.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::protocol::{StateChangeEvent, StateChangeKind};

/// Capacity of the in-memory host's change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Read access to host state plus a change feed.
pub trait HostStateAccessor: Send + Sync {
    /// Complete point-in-time snapshot.
    fn current_state(&self) -> Value;

    /// Subscribe to typed change events.
    fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent>;
}

/// Failure reported by the host while executing a command.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The host has no such command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    /// Arguments were rejected by the host.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The command ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Performs a named host operation.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` with positional `args`.
    async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, ExecutionError>;
}

/// Membership check for client-triggered commands.
pub trait Allowlist: Send + Sync {
    /// Whether `command` may be executed on behalf of a client.
    fn is_allowed(&self, command: &str) -> bool;
}

/// Allowlist built from configuration.
///
/// Entries are exact command names, or `prefix.*` to admit every command
/// under `prefix.`.
#[derive(Clone, Debug, Default)]
pub struct StaticAllowlist {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl StaticAllowlist {
    /// Build from configured entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if let Some(prefix) = entry.strip_suffix('*') {
                list.prefixes.push(prefix.to_owned());
            } else {
                let _ = list.exact.insert(entry.to_owned());
            }
        }
        list
    }
}

impl Allowlist for StaticAllowlist {
    fn is_allowed(&self, command: &str) -> bool {
        if command.is_empty() {
            return false;
        }
        self.exact.contains(command) || self.prefixes.iter().any(|p| command.starts_with(p.as_str()))
    }
}

/// Reference host that keeps its state as a JSON object keyed by change kind.
pub struct InMemoryHost {
    state: RwLock<Map<String, Value>>,
    tx: broadcast::Sender<StateChangeEvent>,
}

impl InMemoryHost {
    /// A host with empty state.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(Map::new()),
            tx,
        }
    }

    /// Record `data` as the latest value for `kind` and publish an
    /// incremental change.
    pub fn apply(&self, kind: StateChangeKind, data: Value) {
        let _ = self.state.write().insert(kind.as_str().to_owned(), data.clone());
        self.publish(StateChangeEvent::incremental(kind, data));
    }

    /// Publish a full snapshot of the current state, requesting an immediate
    /// resync of every client.
    pub fn request_resync(&self) {
        self.publish(StateChangeEvent::full_snapshot(self.current_state()));
    }

    /// Publish an arbitrary event. Dropped when nobody is subscribed.
    pub fn publish(&self, event: StateChangeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStateAccessor for InMemoryHost {
    fn current_state(&self) -> Value {
        Value::Object(self.state.read().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.tx.subscribe()
    }
}
