//! bridge gateway
//!
//! TLS gateway in front of a single HTTPS backend.
//!
//! This service:
//! - Accepts TCP connections on one listen address
//! - Admits at most `BRIDGE_MAX_CLIENTS` concurrent connections
//! - Forwards each one to the backend, either as opaque TLS passthrough or
//!   by terminating TLS and reframing HTTP/1.1 messages
//! - Keeps a small telemetry ring of recent exchanges

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge_gateway::config::{Config, ModeSetting};
use bridge_gateway::proxy::{wait_for_link, BackendMonitor, BufferPool, Listener, TelemetryLog};
use bridge_gateway::status::{run_status_loop, StatusSources};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BRIDGE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting bridge gateway");
    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        terminating = matches!(config.mode, ModeSetting::Terminating { .. }),
        max_clients = config.max_clients,
        buffer_size = config.buffer_size,
        "Configuration loaded"
    );

    // Shared state, created once for the process lifetime.
    let pool = Arc::new(BufferPool::new(config.max_clients, config.buffer_size));
    let telemetry = Arc::new(TelemetryLog::new(config.telemetry_capacity));

    let monitor = Arc::new(BackendMonitor::new(config.backend_addr, config.connect_timeout));
    let (ready_tx, ready_rx) = watch::channel(!config.wait_for_backend);
    tokio::spawn(Arc::clone(&monitor).run(
        config.probe_interval,
        config.wait_for_backend.then_some(ready_tx),
    ));

    wait_for_link(ready_rx).await;

    let proxy_config = config.proxy_config()?;
    let listener = Arc::new(
        Listener::bind(proxy_config, Arc::clone(&pool), Arc::clone(&telemetry))
            .await
            .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status = tokio::spawn(run_status_loop(
        StatusSources {
            pool,
            telemetry,
            stats: listener.stats(),
            monitor: Some(monitor),
        },
        config.status_interval,
        shutdown_rx,
    ));

    tokio::select! {
        result = Arc::clone(&listener).run() => {
            if let Err(e) = result {
                error!(error = %e, "Listener error");
                return Err(e.into());
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = status.await;
    info!("Bridge gateway stopped");
    Ok(())
}
