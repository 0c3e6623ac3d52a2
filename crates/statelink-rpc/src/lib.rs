//! # statelink-rpc
//!
//! Inbound half of the client protocol:
//!
//! - [`validation`]: shape checks that turn raw text into a typed
//!   [`types::InboundMessage`], or a rejection that still carries the
//!   correlation id when one could be read
//! - [`errors`]: the router error taxonomy and client-safe messages
//! - [`registry`]: handlers for `fileSystem`/`git`/`prompt`/`config`
//!   operations, plus [`registry::run_guarded`], the timeout and panic
//!   boundary the router wraps around each message

#![deny(unsafe_code)]

pub mod errors;
pub mod registry;
pub mod types;
pub mod validation;

pub use errors::RouterError;
pub use registry::{OperationHandler, OperationRegistry};
pub use types::{InboundMessage, OperationRequest};
