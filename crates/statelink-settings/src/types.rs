//! Settings schema.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use statelink_core::backoff::{
    BackoffConfig, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS, DEFAULT_JITTER_FACTOR,
    DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES,
};
use statelink_core::protocol::ClientPreferences;

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Listener and admission policy.
    pub server: ServerSettings,
    /// Defaults applied to newly admitted clients.
    pub broadcast: BroadcastSettings,
    /// Reconnection and health checking.
    pub recovery: RecoverySettings,
    /// Client-triggered command policy.
    pub commands: CommandSettings,
}

/// Listener and admission policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum registered connections, including ones awaiting recovery.
    pub max_connections: usize,
    /// Origin allowlist: exact origins, `*`, or `*.domain` suffix patterns.
    pub allowed_origins: Vec<String>,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Delay between the welcome message and the hydration snapshot.
    pub settle_delay_ms: u64,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_connections: 10,
            allowed_origins: vec!["*".to_string()],
            max_message_size: 1024 * 1024,
            settle_delay_ms: 100,
            outbound_queue: 1024,
        }
    }
}

/// Defaults for newly admitted clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastSettings {
    /// Initial filtering and throttling preferences.
    pub preferences: ClientPreferences,
    /// Whether clients receive deltas (`true`) or full values.
    pub incremental_updates: bool,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            preferences: ClientPreferences::default(),
            incremental_updates: true,
        }
    }
}

/// Reconnection backoff and health checking.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoverySettings {
    /// Attempts before a client is declared failed.
    pub max_retries: u32,
    /// Delay before the first attempt.
    pub initial_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub backoff_multiplier: f64,
    /// Randomize delays.
    pub jitter_enabled: bool,
    /// Half-width of the jitter band.
    pub jitter_factor: f64,
    /// Period of the liveness sweep.
    pub health_check_interval_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_enabled: true,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            health_check_interval_ms: 30_000,
        }
    }
}

impl RecoverySettings {
    /// Backoff parameters for the recovery manager.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            jitter_enabled: self.jitter_enabled,
            jitter_factor: self.jitter_factor,
        }
    }

    /// Liveness sweep period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Client-triggered command policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandSettings {
    /// Allowed command names; `prefix.*` admits a whole namespace.
    pub allowed: Vec<String>,
}

impl SyncSettings {
    /// Reject values that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundQueue must be at least 1".into(),
            ));
        }
        let r = &self.recovery;
        if r.backoff_multiplier < 1.0 || !r.backoff_multiplier.is_finite() {
            return Err(SettingsError::InvalidValue(format!(
                "recovery.backoffMultiplier must be >= 1 (got {})",
                r.backoff_multiplier
            )));
        }
        if r.initial_delay_ms > r.max_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "recovery.initialDelayMs ({}) exceeds recovery.maxDelayMs ({})",
                r.initial_delay_ms, r.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&r.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "recovery.jitterFactor must be within [0, 1] (got {})",
                r.jitter_factor
            )));
        }
        if r.health_check_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "recovery.healthCheckIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }
}
