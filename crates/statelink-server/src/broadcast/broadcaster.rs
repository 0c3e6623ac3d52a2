//! Versioned state fan-out.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use statelink_core::host::HostStateAccessor;
use statelink_core::protocol::StateBroadcast;
use statelink_core::{ClientId, Envelope, StateChangeEvent, StateChangeKind, StateVersion};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::throttle::ThrottleScheduler;
use crate::metrics::{BROADCASTS_DROPPED_TOTAL, BROADCASTS_SENT_TOTAL, STATE_VERSION};
use crate::registry::ConnectionRegistry;
use crate::websocket::connection::ClientConnection;

/// Turns host change events into per-client state messages.
pub struct StateBroadcaster {
    registry: Arc<ConnectionRegistry>,
    version: Arc<StateVersion>,
    host: Arc<dyn HostStateAccessor>,
    throttle: ThrottleScheduler,
    emit: Mutex<()>,
    cancel: CancellationToken,
}

impl StateBroadcaster {
    /// Create a broadcaster. `cancel` stops hydration timers and the event
    /// loop.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        version: Arc<StateVersion>,
        host: Arc<dyn HostStateAccessor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            version,
            host,
            throttle: ThrottleScheduler::new(),
            emit: Mutex::new(()),
            cancel,
        }
    }

    /// Current global state version.
    pub fn current_version(&self) -> u64 {
        self.version.current()
    }

    /// Handle one host event and return the version it was stamped with.
    ///
    /// Full snapshots go to every connected client immediately. Anything
    /// else is filtered by each client's preferences and scheduled on its
    /// `(client, kind)` throttle, replacing whatever was pending there.
    pub fn on_host_event(&self, event: StateChangeEvent) -> u64 {
        let _emit = self.emit.lock();
        let version = self.version.bump();
        #[allow(clippy::cast_precision_loss)]
        gauge!(STATE_VERSION).set(version as f64);

        if event.is_full_snapshot() {
            self.send_snapshot_to_all(&event, version);
            return version;
        }

        let Some(delta) = serialize(&StateBroadcast::from_event(&event, version)) else {
            return version;
        };
        let mut full_value: Option<Option<Arc<String>>> = None;

        for conn in self.registry.connected() {
            let prefs = conn.preferences();
            if !event.kind.passes(&prefs) {
                continue;
            }
            let message = if conn.incremental_updates() || !event.incremental {
                delta.clone()
            } else {
                match full_value
                    .get_or_insert_with(|| self.full_value_message(&event, version))
                    .clone()
                {
                    Some(m) => m,
                    None => continue,
                }
            };
            self.schedule_send(
                conn.id.clone(),
                event.kind,
                Duration::from_millis(prefs.throttle_ms),
                message,
                version,
            );
        }

        debug!(change_type = %event.kind, state_version = version, "host event scheduled");
        version
    }

    /// Push a full snapshot of current host state to everyone. Every call
    /// bumps the version, even when nothing changed.
    pub fn resync(&self) -> u64 {
        self.on_host_event(StateChangeEvent::full_snapshot(self.host.current_state()))
    }

    /// Send a full snapshot to one client, stamped with the current version.
    /// Returns the version, or `None` when the client is gone or the send
    /// was dropped.
    pub fn send_snapshot_to(&self, client_id: &ClientId) -> Option<u64> {
        let conn = self.registry.lookup(client_id)?;
        let version = self.version.current();
        let event = StateChangeEvent::full_snapshot(self.host.current_state());
        let json = serialize(&StateBroadcast::from_event(&event, version))?;
        deliver(&conn, json, version, StateChangeKind::FullState).then_some(version)
    }

    /// Send `client_id` its hydration snapshot after `delay`.
    pub fn schedule_hydration(self: &Arc<Self>, client_id: ClientId, delay: Duration) {
        let this = Arc::clone(self);
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    if let Some(version) = this.send_snapshot_to(&client_id) {
                        debug!(%client_id, state_version = version, "hydration snapshot sent");
                    }
                }
                () = this.cancel.cancelled() => {}
            }
        });
    }

    /// Send a status notice to every connected client except `except`.
    pub fn notify_others(&self, except: &ClientId, envelope: &Envelope) -> usize {
        let json = match envelope.to_json() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(error = %e, "failed to serialize notice");
                return 0;
            }
        };
        self.registry
            .connected()
            .iter()
            .filter(|c| c.id != *except)
            .filter(|c| c.send(json.clone()))
            .count()
    }

    /// Drop every pending throttled send for `client_id`.
    pub fn cancel_client(&self, client_id: &ClientId) -> usize {
        self.throttle.cancel_client(client_id)
    }

    /// Pending throttled sends.
    pub fn pending_count(&self) -> usize {
        self.throttle.pending_count()
    }

    /// Consume host events until cancelled or the host goes away.
    ///
    /// When the receiver lags, skipped events are replaced by a resync.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<StateChangeEvent>) {
        info!("state broadcaster started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let _ = self.on_host_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "broadcaster lagged behind host, resyncing");
                        let _ = self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("state broadcaster stopped");
    }

    /// Stop the event loop and hydration timers and cancel every pending
    /// send.
    pub fn dispose(&self) {
        self.cancel.cancel();
        let cancelled = self.throttle.cancel_all();
        debug!(cancelled, "broadcaster disposed");
    }

    fn send_snapshot_to_all(&self, event: &StateChangeEvent, version: u64) {
        let Some(json) = serialize(&StateBroadcast::from_event(event, version)) else {
            return;
        };
        let conns = self.registry.connected();
        let delivered = conns
            .iter()
            .filter(|c| deliver(c, json.clone(), version, event.kind))
            .count();
        info!(state_version = version, recipients = conns.len(), delivered, "full snapshot broadcast");
    }

    /// Payload for clients that opted out of deltas: the host's current
    /// value for the changed kind.
    fn full_value_message(&self, event: &StateChangeEvent, version: u64) -> Option<Arc<String>> {
        let state = self.host.current_state();
        let data = state
            .get(event.kind.as_str())
            .cloned()
            .unwrap_or_else(|| event.data.clone());
        let full = StateChangeEvent {
            data,
            incremental: false,
            ..event.clone()
        };
        serialize(&StateBroadcast::from_event(&full, version))
    }

    fn schedule_send(
        &self,
        client_id: ClientId,
        kind: StateChangeKind,
        delay: Duration,
        message: Arc<String>,
        version: u64,
    ) {
        let registry = Arc::clone(&self.registry);
        let target = client_id.clone();
        let _ = self.throttle.schedule(client_id, kind, delay, move || {
            if let Some(conn) = registry.lookup(&target) {
                let _ = deliver(&conn, message, version, kind);
            }
        });
    }
}

fn serialize(payload: &StateBroadcast) -> Option<Arc<String>> {
    match Envelope::broadcast(payload).to_json() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(change_type = %payload.change_type, error = %e, "failed to serialize state message");
            None
        }
    }
}

/// Queue one state message and record its version on success.
fn deliver(conn: &ClientConnection, json: Arc<String>, version: u64, kind: StateChangeKind) -> bool {
    if conn.send(json) {
        conn.record_state_version(version);
        counter!(BROADCASTS_SENT_TOTAL, "change_type" => kind.as_str()).increment(1);
        true
    } else {
        counter!(BROADCASTS_DROPPED_TOTAL).increment(1);
        warn!(
            client_id = %conn.id,
            change_type = %kind,
            state_version = version,
            dropped = conn.drop_count(),
            "state message dropped"
        );
        false
    }
}
