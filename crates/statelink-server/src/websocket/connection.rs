//! Per-client connection state.
//!
//! A [`ClientConnection`] outlives its transport: when a client drops
//! abnormally the transport is detached but the connection (preferences,
//! last delivered version) stays registered until recovery resolves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use statelink_core::protocol::{ClientPreferences, CloseCode, PreferencesPatch};
use statelink_core::{ClientId, Envelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The live half of a connection: its outbound queue and close signal.
#[derive(Debug)]
struct Transport {
    tx: mpsc::Sender<Arc<String>>,
    generation: u64,
    closer: CancellationToken,
    close_code: Arc<Mutex<Option<CloseCode>>>,
}

/// Held by the session that owns an attached transport.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    /// Distinguishes this attachment from later ones after a resume.
    pub generation: u64,
    /// Cancelled when the server asks the session to close.
    pub closer: CancellationToken,
    close_code: Arc<Mutex<Option<CloseCode>>>,
}

impl TransportHandle {
    /// Close code requested via [`ClientConnection::close`], if any.
    pub fn requested_code(&self) -> Option<CloseCode> {
        *self.close_code.lock()
    }
}

/// A registered client.
#[derive(Debug)]
pub struct ClientConnection {
    /// Connection id, stable across resumes.
    pub id: ClientId,
    /// `Origin` header presented at admission.
    pub origin: Option<String>,
    /// When the connection was first admitted.
    pub connected_at: DateTime<Utc>,
    transport: Mutex<Option<Transport>>,
    next_generation: AtomicU64,
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    preferences: RwLock<ClientPreferences>,
    incremental_updates: AtomicBool,
    last_state_version: AtomicU64,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// A connection with no transport attached yet.
    pub fn new(
        id: ClientId,
        origin: Option<String>,
        preferences: ClientPreferences,
        incremental_updates: bool,
    ) -> Self {
        Self {
            id,
            origin,
            connected_at: Utc::now(),
            transport: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            preferences: RwLock::new(preferences),
            incremental_updates: AtomicBool::new(incremental_updates),
            last_state_version: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
        }
    }

    // ── Transport ───────────────────────────────────────────────────

    /// Attach an outbound queue. Any previous transport is closed with
    /// going-away.
    pub fn attach(&self, tx: mpsc::Sender<Arc<String>>) -> TransportHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = TransportHandle {
            generation,
            closer: CancellationToken::new(),
            close_code: Arc::new(Mutex::new(None)),
        };
        let previous = self.transport.lock().replace(Transport {
            tx,
            generation,
            closer: handle.closer.clone(),
            close_code: handle.close_code.clone(),
        });
        if let Some(old) = previous {
            *old.close_code.lock() = Some(CloseCode::GOING_AWAY);
            old.closer.cancel();
        }
        self.mark_alive();
        handle
    }

    /// Detach the transport if it is still the one identified by
    /// `generation`. Returns whether anything was detached.
    pub fn detach(&self, generation: u64) -> bool {
        let mut transport = self.transport.lock();
        if transport.as_ref().is_some_and(|t| t.generation == generation) {
            *transport = None;
            true
        } else {
            false
        }
    }

    /// Whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        self.transport.lock().is_some()
    }

    /// Ask the owning session to close with `code`. Returns `false` when no
    /// transport is attached.
    pub fn close(&self, code: CloseCode) -> bool {
        let transport = self.transport.lock();
        let Some(t) = transport.as_ref() else {
            return false;
        };
        *t.close_code.lock() = Some(code);
        t.closer.cancel();
        true
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Queue a text frame.
    ///
    /// Returns `false` when detached or the queue is full or closed; the
    /// message is dropped and counted.
    pub fn send(&self, message: Arc<String>) -> bool {
        let sent = self
            .transport
            .lock()
            .as_ref()
            .is_some_and(|t| t.tx.try_send(message).is_ok());
        if !sent {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Serialize and queue an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "failed to serialize envelope");
                false
            }
        }
    }

    /// Messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Record inbound activity (any frame, including pongs).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Return and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound activity.
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    // ── Preferences ─────────────────────────────────────────────────

    /// Current preferences.
    pub fn preferences(&self) -> ClientPreferences {
        self.preferences.read().clone()
    }

    /// Apply a partial update and return the result.
    pub fn apply_preferences(&self, patch: &PreferencesPatch) -> ClientPreferences {
        let mut prefs = self.preferences.write();
        prefs.apply(patch);
        prefs.clone()
    }

    /// Whether this client receives deltas.
    pub fn incremental_updates(&self) -> bool {
        self.incremental_updates.load(Ordering::Relaxed)
    }

    /// Switch between deltas and full values.
    pub fn set_incremental_updates(&self, enabled: bool) {
        self.incremental_updates.store(enabled, Ordering::Relaxed);
    }

    // ── Versions ────────────────────────────────────────────────────

    /// Record that a message stamped `version` was queued.
    pub fn record_state_version(&self, version: u64) {
        let _ = self.last_state_version.fetch_max(version, Ordering::Relaxed);
    }

    /// Highest state version queued to this client.
    pub fn last_state_version(&self) -> u64 {
        self.last_state_version.load(Ordering::Relaxed)
    }
}
