//! # statelink-core
//!
//! Foundation types shared by every statelink crate:
//!
//! - [`protocol`]: the JSON wire envelope, message types, close codes, and
//!   the state-change payloads pushed to clients
//! - [`version`]: the process-wide monotonic state version
//! - [`reconcile`]: client-side staleness filter keyed on state version
//! - [`backoff`]: exponential backoff with jitter for the recovery manager
//! - [`host`]: traits for the host application's state, command executor and
//!   allowlist, plus an in-memory host used by the binary and tests
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod backoff;
pub mod host;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod reconcile;
pub mod version;

pub use ids::ClientId;
pub use protocol::{CloseCode, Envelope, MessageType, StateChangeEvent, StateChangeKind};
pub use version::StateVersion;
