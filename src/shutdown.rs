//! Graceful Shutdown Module
//!
//! Turns SIGINT/SIGTERM into a broadcast that the HTTP server listens for.
//! The server stops accepting connections and drains in-flight responses for
//! up to the configured shutdown timeout.

use crate::{ProxyError, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Drain period granted to in-flight connections
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Shutdown signal for one component
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.subscribe())
    }

    /// Wait for SIGINT or SIGTERM, then broadcast shutdown
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown();
        Ok(())
    }

    /// Broadcast shutdown to all subscribers
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal. A closed or lagged channel counts as shutdown.
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
        Ok(())
    }
}
