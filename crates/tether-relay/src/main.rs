//! # tether-relay
//!
//! Live-location relay binary: loads settings, wires the relay core to the
//! WebSocket server, and runs until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::clock::SystemClock;
use tether_runtime::sweeper::spawn_sweeper;
use tether_runtime::{DeviceTokenRegistry, LifecycleManager, RelayConfig};
use tether_server::auth::{IdentityProvider, JwtIdentityProvider, RejectAllIdentityProvider};
use tether_server::config::ServerConfig;
use tether_server::server::RelayServer;
use tether_settings::{RelaySettings, TetherSettings};

/// How long shutdown waits for the listener and sweeper.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight pushes.
const PUSH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// tether live-location relay.
#[derive(Parser, Debug)]
#[command(name = "tether-relay", about = "Live-location relay server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn relay_config(settings: &RelaySettings) -> RelayConfig {
    RelayConfig {
        default_duration_ms: settings.default_duration_ms,
        max_duration_ms: settings.max_duration_ms,
        sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
        ended_retention: Duration::from_millis(settings.ended_retention_ms),
        fallback_timeout: Duration::from_millis(settings.fallback_timeout_ms),
    }
}

fn identity_provider(settings: &TetherSettings) -> Arc<dyn IdentityProvider> {
    match JwtIdentityProvider::from_settings(&settings.auth) {
        Some(provider) => Arc::new(provider),
        None => {
            tracing::warn!("no jwt secret configured, every connection will be refused");
            Arc::new(RejectAllIdentityProvider)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings.clone().unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics_handle = tether_server::metrics::install_recorder().context("Failed to install metrics")?;

    let tokens = Arc::new(DeviceTokenRegistry::new());
    let (notifier, notifier_kind) = tether_platform::build_notifier(&settings.push, Arc::clone(&tokens));

    let config = relay_config(&settings.relay);
    let sweep_interval = config.sweep_interval;
    let lifecycle = Arc::new(LifecycleManager::new(config, Arc::new(SystemClock), notifier, tokens));

    let server = RelayServer::new(
        ServerConfig::from(&settings.server),
        Arc::clone(&lifecycle),
        identity_provider(&settings),
        metrics_handle,
    );

    let sweeper = spawn_sweeper(Arc::clone(&lifecycle), sweep_interval, server.shutdown().child_token());
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    tracing::info!(
        notifier = notifier_kind.as_str(),
        "tether relay listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(vec![handle, sweeper], Some(SHUTDOWN_TIMEOUT))
        .await;
    lifecycle.registry().close_all();
    if !lifecycle.router().drain(PUSH_DRAIN_TIMEOUT).await {
        tracing::warn!("some fallback pushes were still in flight at exit");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
