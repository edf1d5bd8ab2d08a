//! Bulwark daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌────────────────────────────────────────────────────────┐
//!                │                        BULWARK                         │
//!   Orchestrator │  ┌──────────────┐      ┌────────────────────────────┐  │
//!   ─────────────┼─▶│ /health/*    │◀─────│ StartupCoordinator         │  │
//!                │  └──────────────┘      │  graph → init → report     │  │
//!   Operator     │  ┌──────────────┐      └─────────────┬──────────────┘  │
//!   ─────────────┼─▶│ /admin/*     │                    │ probes          │
//!                │  └──────┬───────┘                    ▼                 │
//!                │         │              ┌────────────────────────────┐  │
//!                │         ├─────────────▶│ ErrorBoundary              │──┼──▶ Dependencies
//!                │         │              │  └─ BreakerRegistry        │  │
//!                │         │              └────────────────────────────┘  │
//!   Clients      │  ┌──────▼───────┐      ┌────────────────────────────┐  │
//!   ─────────────┼─▶│ /stream (ws) │─────▶│ ConnectionManager          │  │
//!                │  └──────────────┘      │  quotas, sweep, heartbeat  │  │
//!                │                        └────────────────────────────┘  │
//!                └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use bulwark::config::{load_config, watcher::ConfigWatcher, BulwarkConfig};
use bulwark::lifecycle::signals;
use bulwark::observability::{logging, metrics};
use bulwark::{HttpServer, Services, Shutdown};

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Resilience and coordination layer daemon", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BulwarkConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bulwark starting");
    tracing::info!(
        bind_address = %config.server.bind_address,
        max_connections = config.connections.max_total,
        components = config.startup.components.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let services = Services::from_config(&config);
    services.connections.start_background_tasks();

    let coordinator = services.coordinator(&config.startup);
    let shutdown = Shutdown::new();

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    let server = HttpServer::new(services.app_state(coordinator.readiness()));
    let server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    // The watcher must stay alive for reloads to arrive.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path, config.clone());
            let reload_target = services.clone();
            tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    if !update.restart_required.is_empty() {
                        tracing::warn!(
                            sections = ?update.restart_required,
                            "Config sections changed that only apply after a restart"
                        );
                    }
                    reload_target.apply_reload(&update.config);
                }
            });
            match watcher.run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::error!(error = %e, "Config watcher failed to start; hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    match coordinator.run().await {
        Ok(report) if report.accepts_traffic() => {
            tracing::info!(state = report.overall_state.as_str(), "Accepting traffic");
        }
        Ok(report) => {
            tracing::error!(
                state = report.overall_state.as_str(),
                "Startup failed; readiness will report unavailable"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "Invalid startup configuration");
            shutdown.trigger("startup configuration error");
            services.connections.shutdown().await;
            return Err(e.into());
        }
    }

    signals::shutdown_requested().await;
    shutdown.trigger("signal");

    let deadline = Duration::from_secs(config.server.shutdown_timeout_secs);
    shutdown.drain(deadline, server_task).await;
    services.connections.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
