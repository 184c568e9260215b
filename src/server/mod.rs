// src/server/mod.rs

//! Wires the configuration, transport, session, dispatcher, and metrics
//! exporter together and runs until a termination signal arrives.

use crate::config::Config;
use crate::core::SystemClock;
use crate::session::LlrpSession;
use crate::transport::TcpMessageTransport;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod dispatch;
mod metrics_server;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let bind_addr = config.resolve_bind_addr()?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let transport = Arc::new(TcpMessageTransport::new());
    let clock = Arc::new(SystemClock::default());
    let (session, inbound_rx) = LlrpSession::new(
        transport,
        bind_addr,
        config.protocol_version,
        config.keepalive,
        clock,
    );
    let session = Arc::new(session);

    if config.metrics.enabled {
        let metrics_port = config.metrics.port;
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        tokio::spawn(async move {
            metrics_server::run_metrics_server(metrics_port, shutdown_rx_metrics).await;
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    let dispatcher = tokio::spawn(dispatch::run(
        session.clone(),
        inbound_rx,
        config.clone(),
        shutdown_tx.subscribe(),
    ));

    session
        .open(config.open_timeout)
        .await
        .context("Failed to open the LLRP session")?;

    wait_for_termination().await;

    info!("Shutting down. Sending signal to all tasks.");
    if shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    if let Err(e) = session.close(config.close_timeout).await {
        warn!("Session close did not complete cleanly: {e}");
    }
    if let Err(e) = dispatcher.await {
        error!("Dispatcher task panicked: {e:?}");
    }

    info!("Server shutdown complete.");
    Ok(())
}

/// Blocks until SIGINT or SIGTERM is received.
async fn wait_for_termination() {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received, initiating graceful shutdown.");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, initiating graceful shutdown.");
        }
    }
}
