//! Zone Server
//!
//! Accepts client connections and runs the zone simulation loop that owns
//! every session, the world map and all outbound traffic.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use zone_protocol::config::ServerConfig;
use zone_protocol::net::transport::{accept_connections, SessionIds};
use zone_protocol::server::ZoneServer;
use zone_protocol::VERSION;

/// Inbound events that may queue before readers back off
const EVENT_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!(version = VERSION, "Starting zone server");

    let config = ServerConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );
    info!(
        server_name = %config.server_name,
        packet_version = config.packet_version,
        obfuscation = ?config.obfuscation,
        "Zone settings"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

    let server = ZoneServer::new(config.clone())?;

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("Zone server listening on: {}", listener.local_addr()?);

    let ids = Arc::new(SessionIds::new());
    let mut accept_shutdown_rx = shutdown_tx.subscribe();
    let accept_handle = tokio::spawn(async move {
        accept_connections(listener, events_tx, ids, &mut accept_shutdown_rx).await;
    });

    let mut zone_shutdown_rx = shutdown_tx.subscribe();
    let zone_handle = tokio::spawn(async move {
        server.run(events_rx, &mut zone_shutdown_rx).await;
    });

    info!("Server startup complete!");

    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    if let Err(e) = accept_handle.await {
        error!("Acceptor task failed: {}", e);
    }
    if let Err(e) = zone_handle.await {
        error!("Zone task failed: {}", e);
    }

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,zone_protocol=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    let _ = shutdown_tx.send(());
}
