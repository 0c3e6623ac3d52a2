//! Server configuration.

use std::time::Duration;

use statelink_core::backoff::BackoffConfig;
use statelink_core::protocol::ClientPreferences;
use statelink_rpc::registry::HANDLER_TIMEOUT;
use statelink_settings::SyncSettings;

/// Runtime configuration for [`SyncServer`](crate::SyncServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum registered connections, including ones awaiting recovery.
    pub max_connections: usize,
    /// Origin allowlist: exact, `*`, or `*.domain`.
    pub allowed_origins: Vec<String>,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Delay between the welcome and the hydration snapshot.
    pub settle_delay: Duration,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
    /// Preferences given to newly admitted clients.
    pub default_preferences: ClientPreferences,
    /// Whether new clients receive deltas.
    pub incremental_updates: bool,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Liveness sweep period; also the ping period.
    pub health_check_interval: Duration,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10,
            allowed_origins: vec!["*".into()],
            max_message_size: 1024 * 1024,
            settle_delay: Duration::from_millis(100),
            outbound_queue: 1024,
            default_preferences: ClientPreferences::default(),
            incremental_updates: true,
            backoff: BackoffConfig::default(),
            health_check_interval: Duration::from_secs(30),
            handler_timeout: HANDLER_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &SyncSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            allowed_origins: server.allowed_origins.clone(),
            max_message_size: server.max_message_size,
            settle_delay: Duration::from_millis(server.settle_delay_ms),
            outbound_queue: server.outbound_queue,
            default_preferences: settings.broadcast.preferences.clone(),
            incremental_updates: settings.broadcast.incremental_updates,
            backoff: settings.recovery.backoff(),
            health_check_interval: settings.recovery.health_check_interval(),
            handler_timeout: HANDLER_TIMEOUT,
        }
    }
}
