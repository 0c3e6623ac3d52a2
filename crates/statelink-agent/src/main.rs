//! # statelink-agent
//!
//! Sync server binary: loads settings, installs logging and metrics, wires
//! an in-memory demo host and serves until ctrl-c.

#![deny(unsafe_code)]

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use statelink_core::host::{InMemoryHost, StaticAllowlist};
use statelink_core::logging;
use statelink_core::protocol::MessageType;
use statelink_rpc::OperationRegistry;
use statelink_server::{Collaborators, ServerConfig, SyncServer, metrics};
use statelink_settings::{SyncSettings, load_settings_from_path, settings_path};

use crate::demo::{ConfigGet, DemoExecutor};

/// statelink sync server.
#[derive(Parser, Debug)]
#[command(name = "statelink-agent", about = "Real-time state sync server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.statelink/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut SyncSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if args.json_logs {
        logging::init_json_subscriber(&args.log_level);
    } else {
        logging::init_subscriber(&args.log_level);
    }

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply_overrides(&mut settings);

    let metrics_handle = metrics::install_recorder().context("Failed to install metrics recorder")?;

    let host = Arc::new(InMemoryHost::new());
    let collaborators = Collaborators {
        host: host.clone(),
        executor: Arc::new(DemoExecutor::new(host)),
        allowlist: Arc::new(StaticAllowlist::new(&settings.commands.allowed)),
    };
    let mut operations = OperationRegistry::new();
    operations.register(MessageType::Config, "get", ConfigGet::new(&settings));

    let server = SyncServer::new(ServerConfig::from_settings(&settings), collaborators, operations)
        .with_metrics(metrics_handle);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    tracing::info!(
        %addr,
        allowed_commands = settings.commands.allowed.len(),
        "statelink agent listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    server.dispose().await;
    let _ = handle.await;
    tracing::info!("shutdown complete");
    Ok(())
}
