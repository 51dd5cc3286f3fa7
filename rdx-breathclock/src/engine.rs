//! The composition root that wires the Breathclock system together.

use crate::broadcaster::Broadcaster;
use crate::config::BreathConfig;
use crate::error::ConfigError;
use crate::routes::build_router;
use crate::tracker::{system_clock, Clock, StateTracker};
use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The main Breathclock engine.
///
/// Owns the state tracker and the broadcaster and serves the HTTP surface
/// over them. Cloning yields another handle to the same running instance.
/// Must be created inside a tokio runtime: construction spawns the tracker
/// and broadcaster tasks.
#[derive(Clone)]
pub struct BreathEngine {
    config: Arc<BreathConfig>,
    tracker: StateTracker,
    broadcaster: Broadcaster,
    shutdown_tx: broadcast::Sender<()>,
}

impl BreathEngine {
    /// Validates `config` and starts the tracker and broadcaster.
    pub fn new(config: BreathConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: BreathConfig, clock: Clock) -> Result<Self, ConfigError> {
        config.validate()?;
        let table = config.phase_table()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let tracker = StateTracker::spawn_with_clock(table, clock);
        let broadcaster = Broadcaster::spawn(
            tracker.clone(),
            config.broadcaster.clone(),
            shutdown_tx.subscribe(),
        );
        info!(
            tick = ?config.broadcaster.tick(),
            phases = config.tracker.phases.len(),
            "{} {} initialised",
            crate::ENGINE_NAME,
            crate::VERSION
        );
        Ok(Self {
            config: Arc::new(config),
            tracker,
            broadcaster,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &BreathConfig {
        &self.config
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn router(&self) -> Router {
        build_router(self.tracker.clone(), self.broadcaster.clone())
    }

    /// A receiver that fires once when the engine shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signals every loop to stop. Open streams end once the broadcaster
    /// drops its subscribers.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown requested but no task was listening");
        }
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = &self.config.server.bind;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))
    }

    /// Serves the router on `listener` until shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        let mut shutdown_rx = self.subscribe_shutdown();
        info!(%local, "HTTP surface listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("HTTP server failed")?;
        info!("HTTP surface stopped");
        Ok(())
    }

    /// Serves until Ctrl+C, then shuts everything down.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        let mut server = {
            let engine = self.clone();
            tokio::spawn(async move { engine.serve(listener).await })
        };

        info!("Engine running. Press Ctrl+C to shut down.");
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            joined = &mut server => {
                return joined?.and(Err(anyhow::anyhow!("HTTP server exited unexpectedly")));
            }
        }

        info!("Shutdown signal received. Broadcasting to all tasks...");
        self.shutdown();
        match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => error!(%e, "Server task panicked"),
            Err(_) => warn!("Server did not drain within {:?}", DRAIN_TIMEOUT),
        }
        info!("{} has shut down.", crate::ENGINE_NAME);
        Ok(())
    }
}
