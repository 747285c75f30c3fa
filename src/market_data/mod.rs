//! Market data service
//!
//! Owns the feed streams (the main "xtraders" feed plus any named exchange
//! feeds), routes raw frames to per-exchange price handlers, and keeps the
//! candle history and last-price stores the auto trader reads from.

mod connection;

pub use connection::{ConnectionHealth, ConnectionManager, ConnectionState};

use crate::config::MarketDataConfig;
use crate::exchange::ws_client::{self, WsHandle, WsListener};
use crate::types::{Candle, InitState};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MAIN_FEED: &str = "xtraders";
/// Upper bound on stored and served candles per symbol
pub const MAX_CANDLE_HISTORY: usize = 1000;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("Market data service not initialized")]
    NotInitialized,
    #[error("Invalid trading pair format: {0}")]
    InvalidSymbol(String),
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("No feed server available")]
    ServerUnavailable,
    #[error("{name} is in recovery mode, retry in {remaining_secs}s")]
    RecoveryMode { name: String, remaining_secs: u64 },
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("Connection to {0} failed")]
    ConnectionFailed(String),
    #[error("No active feed connection")]
    NoActiveConnection,
}

/// Receives every decoded frame from one feed
pub type PriceHandler = Arc<dyn Fn(&Value) + Send + Sync>;

type HandlerMap = DashMap<String, Vec<(u64, PriceHandler)>>;

struct FeedListener {
    name: String,
    connections: Arc<ConnectionManager>,
    handlers: Arc<HandlerMap>,
    stream_active: Arc<AtomicBool>,
}

impl WsListener for FeedListener {
    fn on_message(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.stream_active.store(true, Ordering::SeqCst);
        self.connections.record_message(&self.name);

        let data: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid message format from {}: {}", self.name, e);
                return;
            }
        };

        // Clone out so handlers may register or remove handlers themselves
        let handlers: Vec<PriceHandler> = self
            .handlers
            .get(&self.name)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(&data);
        }
    }

    fn on_connected(&self) {
        info!("Feed connection established for {}", self.name);
        self.connections.record_connected(&self.name);
    }

    fn on_disconnected(&self, reason: &str) {
        self.connections.record_closed(&self.name, reason);
    }

    fn on_error(&self, error: &str) {
        if self.connections.record_error(&self.name, error) {
            warn!("{} feed degraded, reconnecting", self.name);
        }
    }

    /// Stream task reconnects wait out recovery mode like fresh connects do
    fn reconnect_hold(&self) -> Option<Duration> {
        self.connections.recovery_remaining(&self.name)
    }

    fn on_pong(&self) {
        self.connections.record_pong(&self.name);
    }
}

pub struct MarketDataService {
    config: MarketDataConfig,
    connections: Arc<ConnectionManager>,
    streams: DashMap<String, WsHandle>,
    handlers: Arc<HandlerMap>,
    next_handler_id: AtomicU64,
    candles: DashMap<String, Vec<Candle>>,
    last_prices: DashMap<String, f64>,
    stream_active: Arc<AtomicBool>,
    initialized: AtomicBool,
    init_state: RwLock<InitState>,
    retry_base: Duration,
}

impl MarketDataService {
    pub fn new(config: &MarketDataConfig) -> Self {
        Self {
            config: config.clone(),
            connections: Arc::new(ConnectionManager::new(config)),
            streams: DashMap::new(),
            handlers: Arc::new(DashMap::new()),
            next_handler_id: AtomicU64::new(1),
            candles: DashMap::new(),
            last_prices: DashMap::new(),
            stream_active: Arc::new(AtomicBool::new(false)),
            initialized: AtomicBool::new(false),
            init_state: RwLock::new(InitState::NotStarted),
            retry_base: Duration::from_secs(1),
        }
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    // ==========================================
    // Lifecycle
    // ==========================================

    /// Reset stores and validate the feed configuration
    pub async fn initialize(&self, max_retries: u32) -> Result<(), MarketDataError> {
        *self.init_state.write() = InitState::Starting;
        self.candles.clear();
        self.last_prices.clear();
        self.handlers.clear();
        self.connections.clear();

        let attempts = max_retries.max(1);
        let mut last_error = MarketDataError::NotInitialized;
        for attempt in 0..attempts {
            self.stream_active.store(false, Ordering::SeqCst);
            *self.init_state.write() = InitState::CheckingComponents;

            match ConnectionManager::health_url(&self.config.base_url) {
                Ok(_) => {
                    self.initialized.store(true, Ordering::SeqCst);
                    *self.init_state.write() = InitState::Completed;
                    info!("✅ Market data service initialized");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Market data initialization attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry_base * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        self.initialized.store(false, Ordering::SeqCst);
        *self.init_state.write() = InitState::Failed;
        error!("Market data service initialization failed: {}", last_error);
        Err(last_error)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn init_state(&self) -> InitState {
        *self.init_state.read()
    }

    /// Connect the main feed on the first healthy server
    pub async fn connect(&self) -> Result<(), MarketDataError> {
        if !self.is_initialized() {
            return Err(MarketDataError::NotInitialized);
        }
        self.connections.verify_server_availability().await?;
        let url = self.connections.stream_url(MAIN_FEED);
        self.connect_exchange(MAIN_FEED, &url).await
    }

    /// Open a named feed and wait for it to come up
    pub async fn connect_exchange(&self, name: &str, ws_url: &str) -> Result<(), MarketDataError> {
        if !self.is_initialized() {
            return Err(MarketDataError::NotInitialized);
        }
        if self.streams.contains_key(name) {
            debug!("Feed {} already connected", name);
            return Ok(());
        }
        url::Url::parse(ws_url).map_err(|e| MarketDataError::InvalidUrl(format!("{}: {}", ws_url, e)))?;
        self.connections.begin_attempt(name)?;

        let listener = Arc::new(FeedListener {
            name: name.to_string(),
            connections: Arc::clone(&self.connections),
            handlers: Arc::clone(&self.handlers),
            stream_active: Arc::clone(&self.stream_active),
        });
        let handle = ws_client::spawn(self.connections.ws_config(name, ws_url), listener);

        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let started = Instant::now();
        while !handle.stats().is_connected() {
            if handle.is_finished() {
                return Err(MarketDataError::ConnectionFailed(name.to_string()));
            }
            if started.elapsed() >= timeout {
                handle.close();
                self.connections.record_timeout(name);
                return Err(MarketDataError::Timeout(name.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        info!("✅ Connected to {} feed", name);
        self.streams.insert(name.to_string(), handle);
        Ok(())
    }

    pub fn disconnect_exchange(&self, name: &str) {
        if let Some((_, handle)) = self.streams.remove(name) {
            handle.close();
            self.connections.record_closed(name, "disconnected");
            self.handlers.remove(name);
            info!("Disconnected {} feed", name);
        }
    }

    pub fn disconnect_all(&self) {
        let names: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.disconnect_exchange(&name);
        }
        self.handlers.clear();
        self.stream_active.store(false, Ordering::SeqCst);
    }

    // ==========================================
    // Handlers
    // ==========================================

    /// Register a handler for one feed. Returns an id for removal.
    pub fn add_price_handler(&self, exchange: &str, handler: PriceHandler) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .entry(exchange.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn remove_price_handler(&self, exchange: &str, id: u64) -> bool {
        match self.handlers.get_mut(exchange) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                list.len() != before
            }
            None => false,
        }
    }

    // ==========================================
    // Health
    // ==========================================

    pub fn verify_stream_active(&self) -> bool {
        self.stream_active.load(Ordering::SeqCst) && self.is_initialized()
    }

    pub fn verify_health(&self) -> bool {
        self.is_initialized()
    }

    pub fn connection_status(&self, name: &str) -> bool {
        self.streams
            .get(name)
            .map(|h| h.stats().is_connected())
            .unwrap_or(false)
    }

    pub fn connection_statuses(&self) -> HashMap<String, bool> {
        self.streams
            .iter()
            .map(|e| (e.key().clone(), e.value().stats().is_connected()))
            .collect()
    }

    pub fn connection_health(&self) -> HashMap<String, ConnectionHealth> {
        self.connections.all()
    }

    // ==========================================
    // Subscriptions
    // ==========================================

    pub fn candle_frame(trading_pair: &str) -> Result<String, MarketDataError> {
        if !trading_pair.contains('/') {
            return Err(MarketDataError::InvalidSymbol(trading_pair.to_string()));
        }
        Ok(json!({
            "type": "subscribe",
            "channel": "candles",
            "symbol": trading_pair.replace('/', ""),
        })
        .to_string())
    }

    /// Subscribe to candles on the first connected feed
    pub fn subscribe_to_candles(&self, trading_pair: &str) -> Result<(), MarketDataError> {
        let frame = Self::candle_frame(trading_pair)?;
        for entry in self.streams.iter() {
            if entry.value().stats().is_connected() && entry.value().send(frame.clone()) {
                info!("Subscribed to {} candles on {}", trading_pair, entry.key());
                return Ok(());
            }
            warn!("Feed not connected for {}", entry.key());
        }
        Err(MarketDataError::NoActiveConnection)
    }

    // ==========================================
    // Candle and price stores
    // ==========================================

    /// Replace the candle history for a symbol (oldest first)
    pub fn record_candles(&self, symbol: &str, mut candles: Vec<Candle>) {
        if candles.len() > MAX_CANDLE_HISTORY {
            candles.drain(..candles.len() - MAX_CANDLE_HISTORY);
        }
        if let Some(last) = candles.last() {
            self.last_prices.insert(symbol.to_string(), last.close);
        }
        self.candles.insert(symbol.to_string(), candles);
    }

    /// Append a candle, replacing the newest one if it has the same timestamp
    pub fn push_candle(&self, symbol: &str, candle: Candle) {
        self.last_prices.insert(symbol.to_string(), candle.close);
        let mut history = self.candles.entry(symbol.to_string()).or_default();
        match history.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => *last = candle,
            _ => history.push(candle),
        }
        if history.len() > MAX_CANDLE_HISTORY {
            let excess = history.len() - MAX_CANDLE_HISTORY;
            history.drain(..excess);
        }
    }

    pub fn candle_history(&self, symbol: &str) -> Vec<Candle> {
        self.candles.get(symbol).map(|c| c.clone()).unwrap_or_default()
    }

    pub fn update_price(&self, symbol: &str, price: f64) {
        self.last_prices.insert(symbol.to_string(), price);
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).map(|p| *p)
    }

    pub fn last_prices(&self) -> HashMap<String, f64> {
        self.last_prices
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(minute: i64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    fn unreachable_config() -> MarketDataConfig {
        MarketDataConfig {
            base_url: "ws://127.0.0.1:1".to_string(),
            dev_url: String::new(),
            connection_timeout_secs: 2,
            max_reconnect_attempts: 1,
            reconnect_delay_secs: 0,
            ..MarketDataConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_state() {
        let service = MarketDataService::new(&MarketDataConfig::default());
        assert_eq!(service.init_state(), InitState::NotStarted);
        assert!(matches!(service.connect().await, Err(MarketDataError::NotInitialized)));

        service.initialize(3).await.unwrap();
        assert!(service.is_initialized());
        assert!(service.verify_health());
        assert!(!service.verify_stream_active());
        assert_eq!(service.init_state(), InitState::Completed);
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_url() {
        let config = MarketDataConfig {
            base_url: "nonsense".to_string(),
            ..MarketDataConfig::default()
        };
        let service = MarketDataService::new(&config).with_retry_base(Duration::from_millis(1));
        assert!(matches!(
            service.initialize(2).await,
            Err(MarketDataError::InvalidUrl(_))
        ));
        assert_eq!(service.init_state(), InitState::Failed);
    }

    #[test]
    fn test_candle_frame() {
        let frame: Value = serde_json::from_str(&MarketDataService::candle_frame("BTC/USDT").unwrap()).unwrap();
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["channel"], "candles");
        assert_eq!(frame["symbol"], "BTCUSDT");
        assert!(matches!(
            MarketDataService::candle_frame("BTCUSDT"),
            Err(MarketDataError::InvalidSymbol(_))
        ));
    }

    #[test]
    fn test_subscribe_without_feed() {
        let service = MarketDataService::new(&MarketDataConfig::default());
        assert!(matches!(
            service.subscribe_to_candles("ETH/USDT"),
            Err(MarketDataError::NoActiveConnection)
        ));
    }

    #[test]
    fn test_price_handlers_add_remove() {
        let service = MarketDataService::new(&MarketDataConfig::default());
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = service.add_price_handler(
            MAIN_FEED,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let listener = FeedListener {
            name: MAIN_FEED.to_string(),
            connections: Arc::clone(&service.connections),
            handlers: Arc::clone(&service.handlers),
            stream_active: Arc::clone(&service.stream_active),
        };
        listener.on_message(r#"{"symbol":"ETHUSDT","price":1950}"#);
        listener.on_message("not json");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(service.stream_active.load(Ordering::SeqCst));

        assert!(service.remove_price_handler(MAIN_FEED, id));
        assert!(!service.remove_price_handler(MAIN_FEED, id));
        listener.on_message(r#"{"symbol":"ETHUSDT","price":1951}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_feed_listener_holds_reconnect_in_recovery() {
        let config = MarketDataConfig {
            max_reconnect_attempts: 2,
            ..MarketDataConfig::default()
        };
        let service = MarketDataService::new(&config);
        let listener = FeedListener {
            name: MAIN_FEED.to_string(),
            connections: Arc::clone(&service.connections),
            handlers: Arc::clone(&service.handlers),
            stream_active: Arc::clone(&service.stream_active),
        };

        listener.on_error("refused");
        assert!(listener.reconnect_hold().is_none());
        listener.on_error("refused");
        let hold = listener.reconnect_hold().unwrap();
        assert!(hold > Duration::from_secs(55));
        assert!(service.connection_health()[MAIN_FEED].recovery_mode);
    }

    #[test]
    fn test_candle_store() {
        let service = MarketDataService::new(&MarketDataConfig::default());
        service.record_candles("ETH/USDT", (0..1005).map(|i| candle(i, 100.0 + i as f64)).collect());
        let history = service.candle_history("ETH/USDT");
        assert_eq!(history.len(), MAX_CANDLE_HISTORY);
        assert_eq!(history[0].close, 105.0);
        assert_eq!(service.last_price("ETH/USDT"), Some(1104.0));

        // Same timestamp replaces the newest candle
        service.push_candle("ETH/USDT", candle(1004, 2000.0));
        assert_eq!(service.candle_history("ETH/USDT").len(), MAX_CANDLE_HISTORY);
        service.push_candle("ETH/USDT", candle(1005, 2001.0));
        let history = service.candle_history("ETH/USDT");
        assert_eq!(history.len(), MAX_CANDLE_HISTORY);
        assert_eq!(history.last().unwrap().close, 2001.0);

        service.update_price("BTC/USDT", 30000.0);
        assert_eq!(service.last_prices().len(), 2);
        assert!(service.candle_history("BTC/USDT").is_empty());
    }

    #[tokio::test]
    async fn test_connect_exchange_failures() {
        let service = MarketDataService::new(&unreachable_config());
        service.initialize(1).await.unwrap();

        assert!(matches!(
            service.connect_exchange("bad", "::not a url::").await,
            Err(MarketDataError::InvalidUrl(_))
        ));
        let result = service.connect_exchange("local", "ws://127.0.0.1:1/ws").await;
        assert!(result.is_err());
        assert!(!service.connection_status("local"));
        assert!(service.connection_statuses().is_empty());
        assert!(service.connection_health().contains_key("local"));
    }
}
