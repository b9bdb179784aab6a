//! Server lifecycle management
//!
//! Starts the HTTP/WebSocket server, waits for a shutdown signal or a fatal
//! media engine failure, then drains connections and tears the SFU down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use huddle_api::{create_router, AppState, ConnectionTracker};
use huddle_sfu::engine::LoopbackEngine;
use huddle_sfu::SfuManager;

use crate::config::Config;

/// Huddle server - owns the SFU and the HTTP listener
pub struct HuddleServer {
    config: Config,
    sfu: Arc<SfuManager>,
    connections: ConnectionTracker,
}

/// Why the server stopped waiting
enum StopReason {
    ServerExited,
    Signal,
    EngineFatal(String),
}

impl HuddleServer {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(LoopbackEngine::new(config.engine_config()));
        let sfu = SfuManager::new(config.sfu_config(), engine);
        Self {
            config,
            sfu,
            connections: ConnectionTracker::new(),
        }
    }

    /// Start all servers and wait for shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Huddle server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let http_handle = self.start_http_server(shutdown_rx).await?;
        let mut fatal = self.sfu.fatal_signal();

        let reason = tokio::select! {
            _ = http_handle => StopReason::ServerExited,
            () = shutdown_signal() => StopReason::Signal,
            reason = wait_for_fatal(&mut fatal) => StopReason::EngineFatal(reason),
        };

        let _ = shutdown_tx.send(true);

        match reason {
            StopReason::ServerExited => {
                error!("HTTP server stopped unexpectedly");
                self.shutdown(true).await;
                Err(anyhow::anyhow!("HTTP server stopped unexpectedly"))
            }
            StopReason::Signal => {
                info!("Shutdown signal received, starting graceful shutdown...");
                self.shutdown(true).await;
                Ok(())
            }
            StopReason::EngineFatal(reason) => {
                let grace = self.config.engine_fatal_grace();
                error!(
                    reason = %reason,
                    grace_ms = grace.as_millis(),
                    "Media engine failed, exiting after grace period"
                );
                tokio::time::sleep(grace).await;
                self.shutdown(false).await;
                Err(anyhow::anyhow!("media engine failed: {reason}"))
            }
        }
    }

    /// Gracefully shut down all server components
    async fn shutdown(&self, drain: bool) {
        info!("Shutting down Huddle server...");

        // 1. Wait for active connections to drain (with timeout)
        let active = self.connections.connection_count();
        if drain && active > 0 {
            let drain_timeout = self.config.drain_timeout();
            let drain_poll_interval = Duration::from_millis(500);
            info!(
                "Waiting up to {}s for {} active connection(s) to drain...",
                drain_timeout.as_secs(),
                active
            );
            let deadline = tokio::time::Instant::now() + drain_timeout;
            loop {
                let remaining = self.connections.connection_count();
                if remaining == 0 {
                    info!("All connections drained");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Drain timeout reached with {} connection(s) still active, proceeding with shutdown",
                        remaining
                    );
                    break;
                }
                tokio::time::sleep(drain_poll_interval).await;
            }
        }

        // 2. Disconnect remaining peers and close every router
        self.sfu.shutdown();

        info!("Huddle server shut down complete");
    }

    /// Start HTTP server with graceful shutdown support
    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_addr = self.config.http_address();
        let state = AppState {
            sfu: self.sfu.clone(),
            connections: self.connections.clone(),
            ws: self.config.ws_settings(),
        };
        let router = create_router(state, &self.config.server.ws_path);

        let listener = tokio::net::TcpListener::bind(&http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!(
            "HTTP server listening on {} (signaling at {})",
            http_addr, self.config.server.ws_path
        );

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Resolve once the SFU reports an unrecoverable engine failure
async fn wait_for_fatal(fatal: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        let current = fatal.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if fatal.changed().await.is_err() {
            // Sender gone: the manager was dropped, nothing more will fire
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
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
        () = ctrl_c => {}
        () = terminate => {}
    }
}
