//! Launcher - brings up the UI server and the trading services
//!
//! Startup order: pick a port, serve the API, wait until `/healthz` answers,
//! then initialize trading services unless running standalone. The server
//! runs until the shutdown future resolves, then everything is cleaned up.

use crate::api::create_router;
use crate::app::{AppError, TradingApplication};
use crate::config::AppConfig;
use crate::port_utils::{find_available_port, is_port_in_use};
use crate::AppState;

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("No available port between {start} and {end}")]
    NoAvailablePort { start: u16, end: u16 },
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server not ready after {0}s")]
    ServerNotReady(u64),
    #[error("Trading services failed to initialize: {0}")]
    Initialization(#[from] AppError),
}

/// Progress flags recorded during startup
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StartupState {
    pub server_started: bool,
    pub server_ready: bool,
    pub services_initialized: bool,
}

pub struct Launcher {
    config: AppConfig,
    state: Arc<AppState>,
    client: reqwest::Client,
}

impl Launcher {
    pub fn new(config: AppConfig) -> Result<Self, LauncherError> {
        let app = TradingApplication::new(config.clone())?;
        Ok(Self::with_app(config, Arc::new(app)))
    }

    pub fn with_app(config: AppConfig, app: Arc<TradingApplication>) -> Self {
        let state = Arc::new(AppState::new(app, config.trading.clone()));
        Self {
            config,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Configured port if free, else the first free port above it
    pub fn select_port(&self) -> Result<u16, LauncherError> {
        let port = self.config.server.port;
        if port != 0 && !is_port_in_use(port) {
            return Ok(port);
        }
        let start = port.saturating_add(1);
        let end = port.saturating_add(self.config.server.port_search_range);
        warn!("Port {} is in use, searching {}..={}", port, start, end);
        find_available_port(start, end).ok_or(LauncherError::NoAvailablePort { start, end })
    }

    /// Run until `shutdown` resolves
    pub async fn start<F>(&self, standalone: bool, shutdown: F) -> Result<(), LauncherError>
    where
        F: Future<Output = ()> + Send,
    {
        let port = self.select_port()?;
        let addr = format!("{}:{}", self.config.server.host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| LauncherError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let router = create_router(Arc::clone(&self.state));
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    stop_rx.await.ok();
                })
                .await
        });
        self.state.startup.write().server_started = true;
        info!("Starting UI server on http://{}", addr);

        let result = self.bring_up(&addr, standalone).await;
        if result.is_ok() {
            info!("✅ XTraders ready at http://{} (open it in a browser)", addr);
            shutdown.await;
            info!("Shutdown signal received, starting graceful shutdown...");
        }

        self.cleanup().await;
        stop_tx.send(()).ok();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server error: {}", e),
            Err(e) => error!("Server task failed: {}", e),
        }
        info!("Server shutdown complete");
        result
    }

    async fn bring_up(&self, addr: &str, standalone: bool) -> Result<(), LauncherError> {
        let timeout = Duration::from_secs(self.config.server.health_timeout_secs);
        if !self.wait_for_server(addr, timeout).await {
            error!("UI server failed to start");
            return Err(LauncherError::ServerNotReady(timeout.as_secs()));
        }
        self.state.startup.write().server_ready = true;
        info!("✓ UI server is ready");

        if standalone {
            info!("Standalone mode, trading services not started");
            return Ok(());
        }

        self.initialize_services().await?;
        self.state.startup.write().services_initialized = true;
        info!("✓ Trading services initialized");
        Ok(())
    }

    /// Poll `/healthz` until it answers 200
    async fn wait_for_server(&self, addr: &str, timeout: Duration) -> bool {
        let url = format!("http://{}/healthz", addr);
        let started = Instant::now();
        while started.elapsed() < timeout {
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => warn!("Health check returned {}", response.status()),
                Err(_) => {}
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        false
    }

    async fn initialize_services(&self) -> Result<(), LauncherError> {
        let max_retries = self.config.startup.max_retries.max(1);
        let delay = Duration::from_secs(self.config.startup.retry_delay_secs);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.state.app.initialize(max_retries).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_retries => {
                    error!("Service initialization failed after {} attempts: {}", attempt, e);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("Service initialization attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn cleanup(&self) {
        self.state.auto_trader.stop().await;
        self.state.app.cleanup().await;
    }
}
