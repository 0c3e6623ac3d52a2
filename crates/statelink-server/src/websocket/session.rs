//! One client's WebSocket session, from upgrade through disconnect.
//!
//! Admission runs first; a refused socket gets a policy close and nothing
//! else. An admitted session spawns an outbound forwarder (queue → socket,
//! periodic pings, server-requested close frames) and runs the inbound loop
//! on the calling task. When the loop ends the transport is detached and the
//! close code decides between cleanup and recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use statelink_core::{ClientId, CloseCode, Envelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::connection::{ClientConnection, TransportHandle};
use super::handler::MessageRouter;
use crate::broadcast::StateBroadcaster;
use crate::metrics::{
    WS_ADMISSION_REFUSALS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::recovery::{DisconnectOutcome, RecoveryManager};
use crate::registry::{AdmissionError, Admitted, ConnectionRegistry};

/// How long the outbound forwarder may keep flushing after the session ends.
const OUTBOUND_DRAIN: Duration = Duration::from_secs(2);

/// Everything a session needs, shared by all sessions.
pub struct SessionContext {
    /// Admitted connections.
    pub registry: Arc<ConnectionRegistry>,
    /// State fan-out, used for hydration and throttle cleanup.
    pub broadcaster: Arc<StateBroadcaster>,
    /// Inbound dispatch.
    pub router: Arc<MessageRouter>,
    /// Reconnection after abnormal closes.
    pub recovery: Arc<RecoveryManager>,
    /// Delay between the welcome and the hydration snapshot.
    pub settle_delay: Duration,
    /// Outbound queue depth per connection.
    pub outbound_queue: usize,
    /// Liveness sweep period. Pings go out twice per period.
    pub health_check_interval: Duration,
    /// Server-wide shutdown.
    pub shutdown: CancellationToken,
}

/// How the inbound loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    /// The peer closed, or the socket failed.
    Peer(CloseCode),
    /// The server asked this session to close.
    Server(CloseCode),
    /// The server is shutting down.
    Shutdown,
}

impl Exit {
    fn code(self) -> CloseCode {
        match self {
            Self::Peer(code) | Self::Server(code) => code,
            Self::Shutdown => CloseCode::GOING_AWAY,
        }
    }
}

/// Admit the socket and run its session. `resume` names a connection the
/// client wants to continue.
pub async fn run_ws_session(
    socket: WebSocket,
    origin: Option<String>,
    resume: Option<ClientId>,
    ctx: Arc<SessionContext>,
) {
    let (tx, rx) = mpsc::channel::<Arc<String>>(ctx.outbound_queue);
    match ctx.registry.admit(origin.as_deref(), resume.as_ref(), tx) {
        Ok(admitted) => run_admitted(socket, admitted, rx, ctx).await,
        Err(err) => refuse(socket, &err).await,
    }
}

/// Close a refused socket with the policy code.
pub async fn refuse(mut socket: WebSocket, err: &AdmissionError) {
    warn!(reason = err.reason(), error = %err, "connection refused");
    counter!(WS_ADMISSION_REFUSALS_TOTAL, "reason" => err.reason()).increment(1);
    let frame = CloseFrame {
        code: err.close_code().0,
        reason: err.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "failed to send refusal close frame");
    }
}

/// Welcome status sent right after admission.
pub fn welcome(connection: &ClientConnection, state_version: u64, resumed: bool, operations: Vec<String>) -> Envelope {
    Envelope::status(json!({
        "event": "connected",
        "clientId": connection.id,
        "stateVersion": state_version,
        "resumed": resumed,
        "capabilities": {
            "incrementalUpdates": connection.incremental_updates(),
            "throttling": true,
            "resume": true,
            "operations": operations,
        },
    }))
}

#[instrument(skip_all, fields(client_id = %admitted.connection.id, resumed = admitted.resumed))]
async fn run_admitted(
    socket: WebSocket,
    admitted: Admitted,
    rx: mpsc::Receiver<Arc<String>>,
    ctx: Arc<SessionContext>,
) {
    let Admitted {
        connection,
        transport,
        resumed,
    } = admitted;
    let client_id = connection.id.clone();
    let started = Instant::now();

    info!(origin = connection.origin.as_deref(), "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (ws_tx, mut ws_rx) = socket.split();
    let mut outbound = tokio::spawn(forward_outbound(
        ws_tx,
        rx,
        transport.clone(),
        ctx.health_check_interval / 2,
    ));

    let greeting = welcome(
        &connection,
        ctx.broadcaster.current_version(),
        resumed,
        ctx.router.operations(),
    );
    if !connection.send_envelope(&greeting) {
        warn!("failed to queue welcome");
    }
    ctx.broadcaster.schedule_hydration(client_id.clone(), ctx.settle_delay);
    if resumed && ctx.recovery.nudge(&client_id) {
        debug!("recovery notified of resume");
    }

    let exit = loop {
        let frame = tokio::select! {
            () = transport.closer.cancelled() => {
                break Exit::Server(transport.requested_code().unwrap_or(CloseCode::NORMAL));
            }
            () = ctx.shutdown.cancelled() => {
                let _ = connection.close(CloseCode::GOING_AWAY);
                break Exit::Shutdown;
            }
            frame = ws_rx.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "socket error");
                break Exit::Peer(CloseCode::ABNORMAL);
            }
            None => break Exit::Peer(CloseCode::ABNORMAL),
        };
        connection.mark_alive();

        let text = match message {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF-8 binary frame");
                    let _ = connection.send_envelope(&Envelope::error_response(
                        None,
                        "Binary frames must contain UTF-8 JSON",
                    ));
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                let code = frame.map_or(CloseCode::NO_STATUS, |f| CloseCode(f.code));
                debug!(close_code = %code, "client sent close frame");
                break Exit::Peer(code);
            }
        };

        let response = ctx.router.handle(&client_id, &text).await;
        match response.to_json() {
            Ok(json) => {
                if !connection.send(Arc::new(json)) {
                    debug!("response dropped");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize response, closing");
                let _ = connection.close(CloseCode::INTERNAL_ERROR);
            }
        }
    };

    let code = exit.code();
    let superseded = !connection.detach(transport.generation);
    if tokio::time::timeout(OUTBOUND_DRAIN, &mut outbound).await.is_err() {
        outbound.abort();
    }

    info!(close_code = %code, ?exit, superseded, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "code" => code.0.to_string()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if superseded {
        // A resumed session owns the connection now.
        return;
    }

    let _ = ctx.broadcaster.cancel_client(&client_id);
    let outcome = if exit == Exit::Shutdown {
        let _ = ctx.recovery.forget(&client_id);
        DisconnectOutcome::Cleanup
    } else {
        ctx.recovery.handle_disconnect(&client_id, code)
    };
    if outcome == DisconnectOutcome::Cleanup && ctx.registry.remove_if_detached(&client_id) {
        debug!("connection removed");
    }
}

/// Drain the outbound queue into the socket, ping periodically, and send a
/// close frame when the server closes the transport.
async fn forward_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    transport: TransportHandle,
    ping_every: Duration,
) {
    let mut ping = tokio::time::interval(ping_every);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(text) = queued else { break };
                if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            () = transport.closer.cancelled() => {
                let code = transport.requested_code().unwrap_or(CloseCode::NORMAL);
                let frame = CloseFrame {
                    code: code.0,
                    reason: String::new().into(),
                };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = ws_tx.close().await;
}
