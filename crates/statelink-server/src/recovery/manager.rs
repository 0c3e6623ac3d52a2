//! Reconnection state machine.
//!
//! ```text
//! Connected --abnormal close--> Disconnected --delay(attempt)--> Reconnecting
//!     ^                              ^                              |
//!     |                              +-------- attempt failed ------+
//!     +------------ attempt succeeded ------------------------------+
//!                                    attempts exhausted --> Failed
//! ```
//!
//! A [`RecoveryRecord`] exists only while a client is not `Connected`.
//! Transitions are published on a broadcast channel as [`RecoveryEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use statelink_core::backoff::BackoffConfig;
use statelink_core::{ClientId, CloseCode};
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{RECOVERY_ATTEMPTS_TOTAL, RECOVERY_FAILED_TOTAL, RECOVERY_SUCCEEDED_TOTAL};
use crate::registry::ConnectionRegistry;

/// Capacity of the recovery event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Recovery state of one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryState {
    /// Healthy. Never stored in a record.
    Connected,
    /// Waiting for the next attempt.
    Disconnected,
    /// An attempt is in progress.
    Reconnecting,
    /// Attempts exhausted.
    Failed,
}

/// Snapshot of a client's recovery progress.
#[derive(Clone, Debug)]
pub struct RecoveryRecord {
    /// Current state.
    pub state: RecoveryState,
    /// Attempt number in progress or scheduled (1-based, 0 before scheduling).
    pub attempt: u32,
    /// When the scheduled attempt runs.
    pub next_retry_at: Option<Instant>,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Close code that started recovery.
    pub close_code: CloseCode,
}

/// Published on every transition.
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryEvent {
    /// The client moved to `state`.
    StateChanged {
        /// Client.
        client_id: ClientId,
        /// New state.
        state: RecoveryState,
    },
    /// An attempt was scheduled after `delay`.
    AttemptScheduled {
        /// Client.
        client_id: ClientId,
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The client is connected again.
    Recovered {
        /// Client.
        client_id: ClientId,
        /// Attempt that succeeded.
        attempts: u32,
    },
    /// Attempts exhausted; the client has been cleaned up.
    Failed {
        /// Client.
        client_id: ClientId,
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        last_error: Option<String>,
    },
}

/// What the caller should do after reporting a disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Intentional close: remove the connection now.
    Cleanup,
    /// Recovery started; keep the connection registered.
    Recovering,
}

/// Performs one reconnection attempt.
#[async_trait]
pub trait Reconnector: Send + Sync {
    /// `Ok` when the client is connected again.
    async fn attempt(&self, client_id: &ClientId, attempt: u32) -> Result<(), String>;

    /// Release the client after the last failed attempt. Returns `false` when
    /// it turned out to be connected after all.
    fn abandon(&self, _client_id: &ClientId) -> bool {
        true
    }
}

/// Succeeds once the client has resumed its connection through the
/// registry; abandoning removes the detached registry entry.
pub struct RegistryReconnector {
    registry: Arc<ConnectionRegistry>,
}

impl RegistryReconnector {
    /// Wrap a registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Reconnector for RegistryReconnector {
    async fn attempt(&self, client_id: &ClientId, _attempt: u32) -> Result<(), String> {
        match self.registry.lookup(client_id) {
            Some(conn) if conn.is_connected() => Ok(()),
            Some(_) => Err("client has not resumed".into()),
            None => Err("connection no longer registered".into()),
        }
    }

    fn abandon(&self, client_id: &ClientId) -> bool {
        self.registry.remove_if_detached(client_id)
    }
}

struct Entry {
    record: RecoveryRecord,
    epoch: u64,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

/// Drives per-client reconnection with exponential backoff.
pub struct RecoveryManager {
    config: BackoffConfig,
    reconnector: Arc<dyn Reconnector>,
    records: Mutex<HashMap<ClientId, Entry>>,
    next_epoch: AtomicU64,
    events: broadcast::Sender<RecoveryEvent>,
    cancel: CancellationToken,
}

impl RecoveryManager {
    /// Create a manager. Cancelling `cancel` stops every backoff task.
    pub fn new(
        config: BackoffConfig,
        reconnector: Arc<dyn Reconnector>,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            reconnector,
            records: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
            events,
            cancel,
        }
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Report that `client_id`'s transport closed with `code`.
    pub fn handle_disconnect(self: &Arc<Self>, client_id: &ClientId, code: CloseCode) -> DisconnectOutcome {
        if code.is_intentional() {
            let _ = self.forget(client_id);
            return DisconnectOutcome::Cleanup;
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let wake = Arc::new(Notify::new());
        let previous = self.records.lock().insert(
            client_id.clone(),
            Entry {
                record: RecoveryRecord {
                    state: RecoveryState::Disconnected,
                    attempt: 0,
                    next_retry_at: None,
                    last_error: None,
                    close_code: code,
                },
                epoch,
                cancel: cancel.clone(),
                wake: wake.clone(),
            },
        );
        if let Some(old) = previous {
            old.cancel.cancel();
        }

        info!(%client_id, close_code = %code, "abnormal disconnect, starting recovery");
        self.emit(RecoveryEvent::StateChanged {
            client_id: client_id.clone(),
            state: RecoveryState::Disconnected,
        });

        let this = Arc::clone(self);
        let id = client_id.clone();
        let _ = tokio::spawn(async move { this.run_recovery(id, epoch, cancel, wake).await });
        DisconnectOutcome::Recovering
    }

    /// Run the pending attempt for `client_id` now instead of waiting out
    /// its delay. Used when the client resumes.
    pub fn nudge(&self, client_id: &ClientId) -> bool {
        match self.records.lock().get(client_id) {
            Some(entry) => {
                entry.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stop recovering `client_id` without emitting anything.
    pub fn forget(&self, client_id: &ClientId) -> bool {
        match self.records.lock().remove(client_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a record exists for `client_id`.
    pub fn is_recovering(&self, client_id: &ClientId) -> bool {
        self.records.lock().contains_key(client_id)
    }

    /// Snapshot of `client_id`'s record.
    pub fn record(&self, client_id: &ClientId) -> Option<RecoveryRecord> {
        self.records.lock().get(client_id).map(|e| e.record.clone())
    }

    /// Number of clients in recovery.
    pub fn recovering_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Cancel every backoff task and drop all records.
    pub fn dispose(&self) {
        self.cancel.cancel();
        let drained = self.records.lock().drain().count();
        debug!(drained, "recovery manager disposed");
    }

    #[instrument(skip(self, client_id, cancel, wake), fields(client_id = %client_id))]
    async fn run_recovery(&self, client_id: ClientId, epoch: u64, cancel: CancellationToken, wake: Arc<Notify>) {
        let max = self.config.max_retries;

        for attempt in 1..=max {
            let delay = self.config.delay(attempt);
            let scheduled = self.update(&client_id, epoch, |r| {
                r.state = RecoveryState::Disconnected;
                r.attempt = attempt;
                r.next_retry_at = Some(Instant::now() + delay);
            });
            if !scheduled {
                return;
            }
            debug!(attempt, delay_ms = delay.as_millis(), "reconnection attempt scheduled");
            self.emit(RecoveryEvent::AttemptScheduled {
                client_id: client_id.clone(),
                attempt,
                delay,
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = wake.notified() => debug!(attempt, "attempt brought forward"),
                () = cancel.cancelled() => return,
            }

            if !self.update(&client_id, epoch, |r| {
                r.state = RecoveryState::Reconnecting;
                r.next_retry_at = None;
            }) {
                return;
            }
            self.emit(RecoveryEvent::StateChanged {
                client_id: client_id.clone(),
                state: RecoveryState::Reconnecting,
            });
            counter!(RECOVERY_ATTEMPTS_TOTAL).increment(1);

            match self.reconnector.attempt(&client_id, attempt).await {
                Ok(()) => {
                    if self.finish(&client_id, epoch) {
                        self.recovered(client_id, attempt);
                    }
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "reconnection attempt failed");
                    let _ = self.update(&client_id, epoch, |r| r.last_error = Some(e));
                }
            }
        }

        self.fail(client_id, epoch, max);
    }

    fn fail(&self, client_id: ClientId, epoch: u64, attempts: u32) {
        let last_error = {
            let mut records = self.records.lock();
            match records.get(&client_id) {
                Some(entry) if entry.epoch == epoch => {}
                _ => return,
            }
            if !self.reconnector.abandon(&client_id) {
                let _ = records.remove(&client_id);
                drop(records);
                self.recovered(client_id, attempts);
                return;
            }
            records
                .remove(&client_id)
                .and_then(|entry| entry.record.last_error)
        };

        warn!(%client_id, attempts, ?last_error, "recovery failed, giving up");
        counter!(RECOVERY_FAILED_TOTAL).increment(1);
        self.emit(RecoveryEvent::StateChanged {
            client_id: client_id.clone(),
            state: RecoveryState::Failed,
        });
        self.emit(RecoveryEvent::Failed {
            client_id,
            attempts,
            last_error,
        });
    }

    fn recovered(&self, client_id: ClientId, attempts: u32) {
        info!(%client_id, attempts, "client recovered");
        counter!(RECOVERY_SUCCEEDED_TOTAL).increment(1);
        self.emit(RecoveryEvent::StateChanged {
            client_id: client_id.clone(),
            state: RecoveryState::Connected,
        });
        self.emit(RecoveryEvent::Recovered {
            client_id,
            attempts,
        });
    }

    /// Mutate the record if it still belongs to `epoch`.
    fn update(&self, client_id: &ClientId, epoch: u64, f: impl FnOnce(&mut RecoveryRecord)) -> bool {
        match self.records.lock().get_mut(client_id) {
            Some(entry) if entry.epoch == epoch => {
                f(&mut entry.record);
                true
            }
            _ => false,
        }
    }

    /// Remove the record if it still belongs to `epoch`.
    fn finish(&self, client_id: &ClientId, epoch: u64) -> bool {
        let mut records = self.records.lock();
        if records.get(client_id).is_some_and(|e| e.epoch == epoch) {
            let _ = records.remove(client_id);
            true
        } else {
            false
        }
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.events.send(event);
    }
}
