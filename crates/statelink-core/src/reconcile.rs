//! Client-side reconciliation of versioned state messages.
//!
//! The server makes no ordering promise between the deferred hydration
//! snapshot and fast incremental bursts, or across change kinds. A client
//! stays consistent by applying a message only when its `stateVersion` is
//! strictly greater than the highest version it has applied so far.

use crate::protocol::StateBroadcast;

/// Outcome of offering a message to the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// The message is newer than anything applied; apply it.
    Apply,
    /// The message is stale; discard it.
    Discard {
        /// Highest version applied before this message arrived.
        applied: u64,
    },
}

/// Tracks the highest applied state version.
#[derive(Clone, Debug, Default)]
pub struct StateReconciler {
    highest_applied: Option<u64>,
}

impl StateReconciler {
    /// A reconciler that has applied nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest version applied so far.
    pub fn highest_applied(&self) -> Option<u64> {
        self.highest_applied
    }

    /// Decide whether `message` should be applied, recording it if so.
    pub fn offer(&mut self, message: &StateBroadcast) -> Reconciled {
        match self.highest_applied {
            Some(applied) if message.state_version <= applied => Reconciled::Discard { applied },
            _ => {
                self.highest_applied = Some(message.state_version);
                Reconciled::Apply
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StateChangeEvent, StateChangeKind};
    use serde_json::json;

    fn msg(kind: StateChangeKind, version: u64) -> StateBroadcast {
        let ev = if kind == StateChangeKind::FullState {
            StateChangeEvent::full_snapshot(json!({}))
        } else {
            StateChangeEvent::incremental(kind, json!({}))
        };
        StateBroadcast::from_event(&ev, version)
    }

    #[test]
    fn first_message_always_applies() {
        let mut r = StateReconciler::new();
        assert_eq!(r.offer(&msg(StateChangeKind::Selection, 0)), Reconciled::Apply);
        assert_eq!(r.highest_applied(), Some(0));
    }

    #[test]
    fn incremental_older_than_snapshot_is_discarded() {
        let mut r = StateReconciler::new();
        assert_eq!(r.offer(&msg(StateChangeKind::FullState, 5)), Reconciled::Apply);
        assert_eq!(
            r.offer(&msg(StateChangeKind::DocumentChange, 4)),
            Reconciled::Discard { applied: 5 }
        );
        assert_eq!(
            r.offer(&msg(StateChangeKind::DocumentChange, 5)),
            Reconciled::Discard { applied: 5 }
        );
        assert_eq!(r.offer(&msg(StateChangeKind::DocumentChange, 6)), Reconciled::Apply);
    }

    #[test]
    fn late_snapshot_after_newer_incremental_is_discarded() {
        let mut r = StateReconciler::new();
        assert_eq!(r.offer(&msg(StateChangeKind::Selection, 9)), Reconciled::Apply);
        assert_eq!(
            r.offer(&msg(StateChangeKind::FullState, 8)),
            Reconciled::Discard { applied: 9 }
        );
    }
}
