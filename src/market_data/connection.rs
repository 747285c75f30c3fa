//! Per-connection health tracking for market data streams

use super::MarketDataError;
use crate::config::MarketDataConfig;
use crate::exchange::ws_client::WsConfig;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const USER_AGENT: &str = "XTraders/1.0";
const QUALITY_DECAY: f64 = 0.8;
const RECONNECT_QUALITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    Connecting,
    Connected,
    Error,
    Timeout,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub state: ConnectionState,
    pub quality: f64,
    pub reconnect_attempts: u32,
    pub consecutive_failures: u32,
    pub recovery_mode: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub connected_since: Option<DateTime<Utc>>,
    pub messages_received: u64,
    pub error_count: u64,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            connected: false,
            state: ConnectionState::Initializing,
            quality: 1.0,
            reconnect_attempts: 0,
            consecutive_failures: 0,
            recovery_mode: false,
            last_error: None,
            last_error_at: None,
            last_activity: Utc::now(),
            connected_since: None,
            messages_received: 0,
            error_count: 0,
        }
    }
}

/// Tracks stream health and picks the feed endpoint
pub struct ConnectionManager {
    config: MarketDataConfig,
    active_url: RwLock<String>,
    connections: DashMap<String, ConnectionHealth>,
    client: Client,
}

impl ConnectionManager {
    pub fn new(config: &MarketDataConfig) -> Self {
        let timeout = Duration::from_secs((config.connection_timeout_secs / 3).max(1));
        Self {
            config: config.clone(),
            active_url: RwLock::new(config.base_url.clone()),
            connections: DashMap::new(),
            client: Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn active_url(&self) -> String {
        self.active_url.read().clone()
    }

    /// `wss://host/path` -> `https://host/healthz`
    pub fn health_url(ws_url: &str) -> Result<Url, MarketDataError> {
        let mut url = Url::parse(ws_url).map_err(|e| MarketDataError::InvalidUrl(format!("{}: {}", ws_url, e)))?;
        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            "ws" | "http" => "http",
            other => return Err(MarketDataError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| MarketDataError::InvalidUrl(ws_url.to_string()))?;
        url.set_path("/healthz");
        url.set_query(None);
        Ok(url)
    }

    /// Probe the base feed, then the dev feed. The first healthy one becomes active.
    pub async fn verify_server_availability(&self) -> Result<String, MarketDataError> {
        let candidates = [self.config.base_url.clone(), self.config.dev_url.clone()];
        for ws_url in candidates.iter().filter(|u| !u.is_empty()) {
            let health = match Self::health_url(ws_url) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Skipping feed {}: {}", ws_url, e);
                    continue;
                }
            };
            match self.client.get(health.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Feed server healthy at {}", health);
                    *self.active_url.write() = ws_url.clone();
                    return Ok(ws_url.clone());
                }
                Ok(response) => warn!("Health check {} returned {}", health, response.status()),
                Err(e) => warn!("Server health check failed for {}: {}", ws_url, e),
            }
        }
        Err(MarketDataError::ServerUnavailable)
    }

    /// Stream URL for a named connection on the active feed
    pub fn stream_url(&self, name: &str) -> String {
        format!("{}/ws/{}", self.active_url().trim_end_matches('/'), name)
    }

    /// Client settings derived from the feed configuration
    pub fn ws_config(&self, name: &str, url: &str) -> WsConfig {
        let heartbeat = self.config.heartbeat_interval_secs;
        let mut config = WsConfig::new(name, url);
        config.connect_timeout = Duration::from_secs(self.config.connection_timeout_secs);
        config.heartbeat_timeout = Duration::from_secs(heartbeat * 2);
        config.ping_interval = Some(Duration::from_secs((heartbeat / 3).max(10)));
        config.reconnect_delay = Duration::from_secs(self.config.reconnect_delay_secs);
        config.max_reconnect_attempts = self.config.max_reconnect_attempts;
        config
    }

    fn cooldown_left(&self, health: &ConnectionHealth) -> Option<chrono::Duration> {
        if !health.recovery_mode {
            return None;
        }
        let cooldown = chrono::Duration::seconds(self.config.recovery_cooldown_secs as i64);
        let since_error = health
            .last_error_at
            .map(|at| Utc::now() - at)
            .unwrap_or(cooldown);
        (since_error < cooldown).then(|| cooldown - since_error)
    }

    /// Time left before a connection in recovery mode may retry
    pub fn recovery_remaining(&self, name: &str) -> Option<Duration> {
        let health = self.connections.get(name)?;
        self.cooldown_left(&health).and_then(|left| left.to_std().ok())
    }

    /// Start a connection attempt. Fails while the connection cools down in recovery mode.
    pub fn begin_attempt(&self, name: &str) -> Result<(), MarketDataError> {
        let mut health = self.connections.entry(name.to_string()).or_default();
        if health.recovery_mode {
            if let Some(left) = self.cooldown_left(&health) {
                return Err(MarketDataError::RecoveryMode {
                    name: name.to_string(),
                    remaining_secs: left.num_seconds().max(0) as u64,
                });
            }
            info!("{} leaving recovery mode", name);
            health.recovery_mode = false;
            health.consecutive_failures = 0;
        }
        health.state = ConnectionState::Connecting;
        Ok(())
    }

    pub fn record_connected(&self, name: &str) {
        let mut health = self.connections.entry(name.to_string()).or_default();
        let now = Utc::now();
        health.connected = true;
        health.state = ConnectionState::Connected;
        health.connected_since = Some(now);
        health.last_activity = now;
        health.recovery_mode = false;
        health.consecutive_failures = 0;
        health.reconnect_attempts = 0;
    }

    pub fn record_message(&self, name: &str) {
        if let Some(mut health) = self.connections.get_mut(name) {
            health.last_activity = Utc::now();
            health.messages_received += 1;
        }
    }

    pub fn record_pong(&self, name: &str) {
        if let Some(mut health) = self.connections.get_mut(name) {
            health.last_activity = Utc::now();
            health.quality = 1.0;
        }
    }

    /// Record a failure. Returns true when the connection is degraded: quality
    /// fell below the reconnect threshold or recovery mode was just entered.
    pub fn record_error(&self, name: &str, error: &str) -> bool {
        let mut health = self.connections.entry(name.to_string()).or_default();
        health.connected = false;
        health.state = ConnectionState::Error;
        health.last_error = Some(error.to_string());
        health.last_error_at = Some(Utc::now());
        health.error_count += 1;
        health.consecutive_failures += 1;
        health.reconnect_attempts += 1;
        health.quality *= QUALITY_DECAY;

        if health.consecutive_failures >= self.config.max_reconnect_attempts && !health.recovery_mode {
            warn!("{} entering recovery mode after {} failures", name, health.consecutive_failures);
            health.recovery_mode = true;
            drop(health);
            self.fall_back_to_dev();
            return true;
        }

        let degraded = health.quality < RECONNECT_QUALITY;
        if degraded {
            warn!("Poor connection quality for {} ({:.2})", name, health.quality);
        }
        degraded
    }

    pub fn record_timeout(&self, name: &str) {
        self.record_error(name, "connection timeout");
        if let Some(mut health) = self.connections.get_mut(name) {
            health.state = ConnectionState::Timeout;
        }
    }

    pub fn record_closed(&self, name: &str, reason: &str) {
        if let Some(mut health) = self.connections.get_mut(name) {
            debug!("{} closed: {}", name, reason);
            health.connected = false;
            health.state = ConnectionState::Closed;
        }
    }

    fn fall_back_to_dev(&self) {
        let mut active = self.active_url.write();
        if *active == self.config.base_url && !self.config.dev_url.is_empty() && self.config.dev_url != *active {
            info!("Switching feed to fallback {}", self.config.dev_url);
            *active = self.config.dev_url.clone();
        }
    }

    pub fn health(&self, name: &str) -> Option<ConnectionHealth> {
        self.connections.get(name).map(|h| h.clone())
    }

    pub fn all(&self) -> HashMap<String, ConnectionHealth> {
        self.connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn remove(&self, name: &str) {
        self.connections.remove(name);
    }

    pub fn clear(&self) {
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_attempts: u32) -> ConnectionManager {
        let config = MarketDataConfig {
            max_reconnect_attempts: max_attempts,
            ..MarketDataConfig::default()
        };
        ConnectionManager::new(&config)
    }

    #[test]
    fn test_health_url() {
        assert_eq!(
            ConnectionManager::health_url("wss://api.xtraders.com").unwrap().as_str(),
            "https://api.xtraders.com/healthz"
        );
        assert_eq!(
            ConnectionManager::health_url("ws://localhost:9000/ws/feed?x=1").unwrap().as_str(),
            "http://localhost:9000/healthz"
        );
        assert!(ConnectionManager::health_url("ftp://host").is_err());
        assert!(ConnectionManager::health_url("not a url").is_err());
    }

    #[test]
    fn test_quality_degrades_and_pong_restores() {
        let manager = manager(10);
        manager.begin_attempt("feed").unwrap();
        manager.record_connected("feed");

        assert!(!manager.record_error("feed", "e1"));
        assert!(!manager.record_error("feed", "e2"));
        assert!(!manager.record_error("feed", "e3"));
        // 0.8^4 = 0.4096
        assert!(manager.record_error("feed", "e4"));
        let health = manager.health("feed").unwrap();
        assert_eq!(health.state, ConnectionState::Error);
        assert_eq!(health.last_error.as_deref(), Some("e4"));
        assert!(!health.connected);

        manager.record_pong("feed");
        assert_eq!(manager.health("feed").unwrap().quality, 1.0);
    }

    #[test]
    fn test_recovery_mode_blocks_attempts_and_falls_back() {
        let manager = manager(2);
        manager.begin_attempt("feed").unwrap();
        manager.record_error("feed", "refused");
        assert!(manager.record_error("feed", "refused"));

        let health = manager.health("feed").unwrap();
        assert!(health.recovery_mode);
        assert!(matches!(
            manager.begin_attempt("feed"),
            Err(MarketDataError::RecoveryMode { .. })
        ));
        assert_eq!(manager.active_url(), MarketDataConfig::default().dev_url);

        let remaining = manager.recovery_remaining("feed").unwrap();
        assert!(remaining > Duration::from_secs(55) && remaining <= Duration::from_secs(60));
        assert!(manager.recovery_remaining("other").is_none());
    }

    #[test]
    fn test_recovery_cooldown_expires() {
        let config = MarketDataConfig {
            max_reconnect_attempts: 1,
            recovery_cooldown_secs: 0,
            ..MarketDataConfig::default()
        };
        let manager = ConnectionManager::new(&config);
        manager.record_error("feed", "refused");
        assert!(manager.health("feed").unwrap().recovery_mode);
        assert!(manager.recovery_remaining("feed").is_none());

        manager.begin_attempt("feed").unwrap();
        let health = manager.health("feed").unwrap();
        assert!(!health.recovery_mode);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.state, ConnectionState::Connecting);
    }

    #[test]
    fn test_ws_config_ping_floor() {
        let manager = manager(5);
        let config = manager.ws_config("feed", "wss://api.xtraders.com/ws/feed");
        assert_eq!(config.ping_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(manager.stream_url("xtraders"), "wss://api.xtraders.com/ws/xtraders");
    }

    #[tokio::test]
    async fn test_unreachable_servers() {
        let config = MarketDataConfig {
            base_url: "ws://127.0.0.1:1".to_string(),
            dev_url: "ws://127.0.0.1:2".to_string(),
            connection_timeout_secs: 3,
            ..MarketDataConfig::default()
        };
        let manager = ConnectionManager::new(&config);
        assert!(matches!(
            manager.verify_server_availability().await,
            Err(MarketDataError::ServerUnavailable)
        ));
        assert_eq!(manager.active_url(), "ws://127.0.0.1:1");
    }
}
