//! # statelink-server
//!
//! Keeps remote clients in sync with a host application's state over
//! WebSocket.
//!
//! - [`registry`]: admitted connections, capacity and origin policy
//! - [`websocket`]: per-connection transport state, the message router, the
//!   session loop and the liveness sweep
//! - [`broadcast`]: versioned state fan-out with per-client filtering and
//!   coalescing throttles
//! - [`recovery`]: backoff-driven reconnection state machine and the
//!   notices it triggers for other clients
//! - [`server`]: axum routes (`/ws`, `/health`, `/metrics`) and lifecycle

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod health;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{Collaborators, SyncServer};
