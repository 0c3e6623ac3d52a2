//! Periodic liveness sweep.
//!
//! Each sweep reads and clears every connected client's alive flag. Any
//! inbound frame (pongs included) sets it again, so a client that stayed
//! silent for a whole interval is treated as half-open and closed with
//! [`CloseCode::ABNORMAL`], which sends it into recovery.

use std::sync::Arc;
use std::time::Duration;

use statelink_core::{ClientId, CloseCode};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;

/// Close every connected client that has not been heard from since the
/// previous sweep. Returns the ids that were closed.
pub fn sweep(registry: &ConnectionRegistry) -> Vec<ClientId> {
    let mut dropped = Vec::new();
    for conn in registry.connected() {
        if conn.check_alive() {
            continue;
        }
        warn!(client_id = %conn.id, idle_ms = conn.idle().as_millis(), "client unresponsive, closing");
        if conn.close(CloseCode::ABNORMAL) {
            dropped.push(conn.id.clone());
        }
    }
    dropped
}

/// Sweep every `interval` until cancelled.
pub async fn run_health_monitor(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dropped = sweep(&registry);
                if !dropped.is_empty() {
                    debug!(count = dropped.len(), "health sweep closed clients");
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}
