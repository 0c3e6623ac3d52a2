//! Process-wide state version counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing version stamped on every outbound state message.
///
/// Starts at zero; the first host event moves it to one. It never decreases.
#[derive(Debug, Default)]
pub struct StateVersion {
    value: AtomicU64,
}

impl StateVersion {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new version.
    pub fn bump(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The version currently in effect.
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
