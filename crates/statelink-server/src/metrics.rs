//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names shared across modules.

pub use statelink_rpc::registry::{OPERATION_DURATION_SECONDS, OPERATION_ERRORS_TOTAL, OPERATION_REQUESTS_TOTAL};

/// Connections admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections with an attached transport (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Disconnections (counter, labels: code = numeric close code).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Refused connections (counter, labels: reason).
pub const WS_ADMISSION_REFUSALS_TOTAL: &str = "ws_admission_refusals_total";
/// Inbound messages routed (counter, labels: type = message label or `invalid`).
pub const ROUTER_MESSAGES_TOTAL: &str = "router_messages_total";
/// Router errors (counter, labels: type, code = router error code).
pub const ROUTER_ERRORS_TOTAL: &str = "router_errors_total";
/// State messages delivered (counter, labels: change_type).
pub const BROADCASTS_SENT_TOTAL: &str = "broadcasts_sent_total";
/// State messages dropped on a full or closed queue (counter).
pub const BROADCASTS_DROPPED_TOTAL: &str = "broadcasts_dropped_total";
/// Pending updates replaced before firing (counter).
pub const BROADCASTS_COALESCED_TOTAL: &str = "broadcasts_coalesced_total";
/// Current state version (gauge).
pub const STATE_VERSION: &str = "state_version";
/// Reconnection attempts (counter).
pub const RECOVERY_ATTEMPTS_TOTAL: &str = "recovery_attempts_total";
/// Clients recovered (counter).
pub const RECOVERY_SUCCEEDED_TOTAL: &str = "recovery_succeeded_total";
/// Clients given up on (counter).
pub const RECOVERY_FAILED_TOTAL: &str = "recovery_failed_total";
