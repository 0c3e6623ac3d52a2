//! `SyncServer`: axum HTTP + WebSocket front end and component wiring.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Deserialize;
use statelink_core::host::{Allowlist, CommandExecutor, HostStateAccessor};
use statelink_core::{ClientId, CloseCode, StateVersion};
use statelink_rpc::OperationRegistry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broadcast::StateBroadcaster;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::render;
use crate::recovery::{RecoveryManager, RegistryReconnector, run_recovery_notifier};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::handler::MessageRouter;
use crate::websocket::heartbeat::run_health_monitor;
use crate::websocket::session::{SessionContext, run_ws_session};

/// How long `dispose` waits for background tasks.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-side collaborators the server consumes.
#[derive(Clone)]
pub struct Collaborators {
    /// State snapshots and change feed.
    pub host: Arc<dyn HostStateAccessor>,
    /// Runs allow-listed commands.
    pub executor: Arc<dyn CommandExecutor>,
    /// Command allowlist.
    pub allowlist: Arc<dyn Allowlist>,
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    session: Arc<SessionContext>,
    recovery: Arc<RecoveryManager>,
    version: Arc<StateVersion>,
    metrics: Option<PrometheusHandle>,
    max_message_size: usize,
    start_time: Instant,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    host: Arc<dyn HostStateAccessor>,
    registry: Arc<ConnectionRegistry>,
    version: Arc<StateVersion>,
    broadcaster: Arc<StateBroadcaster>,
    recovery: Arc<RecoveryManager>,
    session: Arc<SessionContext>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start_time: Instant,
}

impl SyncServer {
    /// Wire up every component. Nothing runs until [`listen`](Self::listen).
    pub fn new(config: ServerConfig, collaborators: Collaborators, operations: OperationRegistry) -> Self {
        let Collaborators {
            host,
            executor,
            allowlist,
        } = collaborators;
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.allowed_origins.clone(),
            config.default_preferences.clone(),
            config.incremental_updates,
        ));
        let version = Arc::new(StateVersion::new());
        let broadcaster = Arc::new(StateBroadcaster::new(
            registry.clone(),
            version.clone(),
            host.clone(),
            shutdown.child_token(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            config.backoff.clone(),
            Arc::new(RegistryReconnector::new(registry.clone())),
            shutdown.child_token(),
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            broadcaster.clone(),
            operations,
            executor,
            allowlist,
            config.handler_timeout,
        ));
        let session = Arc::new(SessionContext {
            registry: registry.clone(),
            broadcaster: broadcaster.clone(),
            router,
            recovery: recovery.clone(),
            settle_delay: config.settle_delay,
            outbound_queue: config.outbound_queue,
            health_check_interval: config.health_check_interval,
            shutdown: shutdown.token(),
        });

        Self {
            config,
            host,
            registry,
            version,
            broadcaster,
            recovery,
            session,
            shutdown,
            metrics: None,
            tasks: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            session: self.session.clone(),
            recovery: self.recovery.clone(),
            version: self.version.clone(),
            metrics: self.metrics.clone(),
            max_message_size: self.config.max_message_size,
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the background loops, bind the listener and serve until
    /// [`dispose`](Self::dispose). Returns the bound address.
    pub async fn listen(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        self.spawn_background();

        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });

        info!(%addr, max_connections = self.config.max_connections, "sync server listening");
        Ok((addr, handle))
    }

    fn spawn_background(&self) {
        let token = self.shutdown.token();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.broadcaster.clone().run(self.host.subscribe()),
        ));
        tasks.push(tokio::spawn(run_recovery_notifier(
            self.recovery.subscribe(),
            self.broadcaster.clone(),
            token.clone(),
        )));
        tasks.push(tokio::spawn(run_health_monitor(
            self.registry.clone(),
            self.config.health_check_interval,
            token,
        )));
    }

    /// Push a full snapshot to every client. Bumps the version every time.
    pub fn resync(&self) -> u64 {
        self.broadcaster.resync()
    }

    /// Stop serving: cancel every timer and loop, close every session with
    /// going-away, and wait for background tasks.
    pub async fn dispose(&self) {
        info!("disposing sync server");
        self.shutdown.shutdown();
        self.broadcaster.dispose();
        self.recovery.dispose();
        self.registry.clear(CloseCode::GOING_AWAY);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        self.shutdown.graceful_shutdown(tasks, Some(DISPOSE_TIMEOUT)).await;
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// State broadcaster.
    pub fn broadcaster(&self) -> &Arc<StateBroadcaster> {
        &self.broadcaster
    }

    /// Recovery manager.
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.session.registry.len(),
        state.recovery.recovering_count(),
        state.version.current(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    resume: Option<String>,
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let resume = params.resume.filter(|id| !id.is_empty()).map(ClientId::from);
    let ctx = state.session.clone();

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, origin, resume, ctx))
}
