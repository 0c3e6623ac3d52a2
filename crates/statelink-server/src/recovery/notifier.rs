//! Tells the remaining clients when a peer recovers or is given up on.

use std::sync::Arc;

use serde_json::json;
use statelink_core::{ClientId, Envelope};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::manager::RecoveryEvent;
use crate::broadcast::StateBroadcaster;

/// Status notice for a recovery outcome.
pub fn recovery_notice(event: &str, client_id: &ClientId, attempts: u32) -> Envelope {
    Envelope::status(json!({
        "event": event,
        "clientId": client_id,
        "attempts": attempts,
    }))
}

/// Forward terminal recovery events to the other connected clients until
/// cancelled.
pub async fn run_recovery_notifier(
    mut events: broadcast::Receiver<RecoveryEvent>,
    broadcaster: Arc<StateBroadcaster>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "recovery notifier lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match event {
            RecoveryEvent::Recovered { client_id, attempts } => {
                let sent = broadcaster.notify_others(
                    &client_id,
                    &recovery_notice("clientRecovered", &client_id, attempts),
                );
                debug!(%client_id, sent, "recovery notice sent");
            }
            RecoveryEvent::Failed {
                client_id,
                attempts,
                ..
            } => {
                let _ = broadcaster.cancel_client(&client_id);
                let sent = broadcaster.notify_others(
                    &client_id,
                    &recovery_notice("clientFailed", &client_id, attempts),
                );
                debug!(%client_id, sent, "failure notice sent");
            }
            RecoveryEvent::StateChanged { .. } | RecoveryEvent::AttemptScheduled { .. } => {}
        }
    }
}
