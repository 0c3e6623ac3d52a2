//! Per-(client, change kind) coalescing timers.
//!
//! At most one send is pending per key. Scheduling onto a key that already
//! has a pending send replaces it, so only the latest payload goes out when
//! the timer fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use statelink_core::{ClientId, StateChangeKind};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics::BROADCASTS_COALESCED_TOTAL;

type Key = (ClientId, StateChangeKind);

struct Pending {
    seq: u64,
    handle: JoinHandle<()>,
}

/// Cancel-and-replace timer map.
#[derive(Default)]
pub struct ThrottleScheduler {
    pending: Arc<Mutex<HashMap<Key, Pending>>>,
    next_seq: AtomicU64,
}

impl ThrottleScheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` after `delay` unless another call for the same key arrives
    /// first. Returns `true` when a pending send was replaced.
    ///
    /// `fire` runs with the timer map locked, so sends for one key are
    /// delivered in scheduling order. It must not call back into the
    /// scheduler.
    pub fn schedule<F>(&self, client_id: ClientId, kind: StateChangeKind, delay: Duration, fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = (client_id, kind);
        let pending = self.pending.clone();
        let task_key = key.clone();

        let mut map = self.pending.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut map = pending.lock();
            if map.get(&task_key).is_some_and(|p| p.seq == seq) {
                let _ = map.remove(&task_key);
                fire();
            }
        });

        let replaced = map.insert(key, Pending { seq, handle });
        drop(map);

        match replaced {
            Some(old) => {
                old.handle.abort();
                counter!(BROADCASTS_COALESCED_TOTAL).increment(1);
                debug!(change_type = %kind, "coalesced pending update");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending send for `client_id`.
    pub fn cancel_client(&self, client_id: &ClientId) -> usize {
        let mut map = self.pending.lock();
        let keys: Vec<Key> = map.keys().filter(|(id, _)| id == client_id).cloned().collect();
        for key in &keys {
            if let Some(p) = map.remove(key) {
                p.handle.abort();
            }
        }
        keys.len()
    }

    /// Cancel everything.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in &drained {
            p.handle.abort();
        }
        drained.len()
    }

    /// Number of pending sends.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether a send is pending for this key.
    pub fn is_pending(&self, client_id: &ClientId, kind: StateChangeKind) -> bool {
        self.pending.lock().contains_key(&(client_id.clone(), kind))
    }
}

impl Drop for ThrottleScheduler {
    fn drop(&mut self) {
        let _ = self.cancel_all();
    }
}
