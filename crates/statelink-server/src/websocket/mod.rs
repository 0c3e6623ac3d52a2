//! WebSocket transport: connection state, message dispatch, the per-client
//! session loop and the liveness sweep.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;
