//! Connection registry and admission policy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use statelink_core::protocol::{ClientPreferences, CloseCode, PreferencesPatch};
use statelink_core::ClientId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::websocket::connection::{ClientConnection, TransportHandle};

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The registry is full.
    #[error("connection limit reached ({max})")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// The `Origin` header failed the allowlist.
    #[error("origin '{origin}' is not allowed")]
    OriginNotAllowed {
        /// Origin as presented, or `<none>`.
        origin: String,
    },
}

impl AdmissionError {
    /// Metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity",
            Self::OriginNotAllowed { .. } => "origin",
        }
    }

    /// Close code sent to the refused client.
    pub fn close_code(&self) -> CloseCode {
        CloseCode::POLICY_VIOLATION
    }
}

/// Origin allowlist.
///
/// Entries are `*` (anything), `*.domain` (`domain` and its subdomains), or
/// an exact origin. Exact entries match either the full header value or its
/// host.
#[derive(Clone, Debug)]
pub struct OriginPolicy {
    entries: Vec<String>,
}

impl OriginPolicy {
    /// Build from configured entries.
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    fn allows_any(&self) -> bool {
        self.entries.iter().any(|e| e == "*")
    }

    /// Whether `origin` may connect. A missing origin only passes `*`.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        if self.allows_any() {
            return true;
        }
        let Some(origin) = origin.map(|o| o.trim().to_ascii_lowercase()) else {
            return false;
        };
        let host = origin_host(&origin);
        self.entries.iter().any(|entry| {
            if let Some(domain) = entry.strip_prefix("*.") {
                host == domain || host.strip_suffix(domain).is_some_and(|p| p.ends_with('.'))
            } else {
                *entry == origin || entry == host
            }
        })
    }
}

/// Host part of an origin: scheme, port and path removed.
fn origin_host(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// A successful admission.
#[derive(Debug)]
pub struct Admitted {
    /// The registered connection.
    pub connection: Arc<ClientConnection>,
    /// Handle for the transport just attached.
    pub transport: TransportHandle,
    /// Whether an existing connection awaiting recovery was resumed.
    pub resumed: bool,
}

/// Registered connections, keyed by id.
///
/// Entries of clients awaiting recovery stay registered (detached) and count
/// against capacity.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
    max_connections: usize,
    origins: OriginPolicy,
    default_preferences: ClientPreferences,
    incremental_updates: bool,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(
        max_connections: usize,
        allowed_origins: Vec<String>,
        default_preferences: ClientPreferences,
        incremental_updates: bool,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            origins: OriginPolicy::new(allowed_origins),
            default_preferences,
            incremental_updates,
        }
    }

    /// Admit a client and attach `tx` as its transport.
    ///
    /// With `resume`, a registered but detached connection of that id is
    /// re-attached instead of creating a new one; an unknown or still
    /// attached id falls back to a fresh admission. Checks and insertion
    /// happen under one write lock, and nothing is allocated on refusal.
    pub fn admit(
        &self,
        origin: Option<&str>,
        resume: Option<&ClientId>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Result<Admitted, AdmissionError> {
        if !self.origins.allows(origin) {
            return Err(AdmissionError::OriginNotAllowed {
                origin: origin.unwrap_or("<none>").to_owned(),
            });
        }

        let mut conns = self.connections.write();

        if let Some(id) = resume {
            match conns.get(id) {
                Some(conn) if !conn.is_connected() => {
                    let connection = conn.clone();
                    let transport = connection.attach(tx);
                    info!(client_id = %id, "connection resumed");
                    return Ok(Admitted {
                        connection,
                        transport,
                        resumed: true,
                    });
                }
                Some(_) => debug!(client_id = %id, "resume target still attached, admitting fresh"),
                None => debug!(client_id = %id, "resume target unknown, admitting fresh"),
            }
        }

        if conns.len() >= self.max_connections {
            return Err(AdmissionError::CapacityExceeded {
                max: self.max_connections,
            });
        }

        let connection = Arc::new(ClientConnection::new(
            ClientId::generate(),
            origin.map(str::to_owned),
            self.default_preferences.clone(),
            self.incremental_updates,
        ));
        let transport = connection.attach(tx);
        let _ = conns.insert(connection.id.clone(), connection.clone());
        Ok(Admitted {
            connection,
            transport,
            resumed: false,
        })
    }

    /// Look up a connection.
    pub fn lookup(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Apply a preference patch. Returns the new preferences, or `None` for
    /// an unknown id.
    pub fn update_preferences(
        &self,
        id: &ClientId,
        patch: &PreferencesPatch,
    ) -> Option<ClientPreferences> {
        self.lookup(id).map(|conn| conn.apply_preferences(patch))
    }

    /// Remove a connection.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.connections.write().remove(id)
    }

    /// Remove `id` unless a transport has been re-attached. Returns `false`
    /// only when the client is connected again.
    pub fn remove_if_detached(&self, id: &ClientId) -> bool {
        let mut conns = self.connections.write();
        match conns.get(id) {
            Some(conn) if conn.is_connected() => false,
            Some(_) => {
                let _ = conns.remove(id);
                true
            }
            None => true,
        }
    }

    /// Registered connections, attached or not.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Connections with an attached transport.
    pub fn connected(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    /// Number of connections with an attached transport.
    pub fn connected_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Remove every connection, closing attached transports with `code`.
    pub fn clear(&self, code: CloseCode) {
        let drained: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in drained {
            let _ = conn.close(code);
        }
    }
}
