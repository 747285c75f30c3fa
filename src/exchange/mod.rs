//! Exchange connectivity
//!
//! Every venue implements [`ExchangeService`]. Shared bookkeeping (order book
//! cache, subscriptions, event fan-out) lives in [`ExchangeBase`] so the venue
//! modules only deal with their own wire formats.

mod auth;
mod binance;
mod integrator;
mod kucoin;
mod sushiswap;
pub mod ws_client;

pub use binance::{BinanceExchange, BinanceUserStream};
pub use integrator::{ExchangeIntegrator, ExchangeInfo};
pub use kucoin::KuCoinExchange;
pub use sushiswap::SushiSwapExchange;

use crate::config::{AppConfig, Credentials};
use crate::order_book::{OrderBook, OrderBookCache, OrderBookEntry};
use crate::types::{Candle, Order, Position, RecentTrade, TradingPair};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info};
use ws_client::WsHandle;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("API credentials not configured for {0}")]
    MissingCredentials(String),
    #[error("IP banned by exchange")]
    Banned,
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("Unexpected response: {0}")]
    Parse(String),
    #[error("Exchange {0} not implemented")]
    NotImplemented(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeKind {
    Cex,
    Dex,
}

/// Events published by every exchange
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    OrderBookUpdated { exchange: String, symbol: String },
    PriceUpdated { exchange: String, symbol: String, price: f64 },
    OrderUpdated(Order),
    Error { exchange: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatus {
    pub name: String,
    pub kind: ExchangeKind,
    pub connected: bool,
    pub stream_connected: bool,
    pub subscriptions: Vec<String>,
    pub order_books: usize,
}

#[async_trait]
pub trait ExchangeService: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ExchangeKind;

    async fn connect(&self, max_retries: u32) -> Result<(), ExchangeError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    async fn available_pairs(&self) -> Result<Vec<TradingPair>, ExchangeError>;
    async fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<RecentTrade>, ExchangeError>;
    async fn subscribe(&self, symbol: &str) -> Result<(), ExchangeError>;
    async fn unsubscribe(&self, symbol: &str) -> Result<(), ExchangeError>;
    async fn order_book(&self, symbol: &str) -> Result<Option<OrderBook>, ExchangeError>;
    async fn candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    /// Open positions held on the venue (none for simulated venues)
    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(Vec::new())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent>;
    fn status(&self) -> ExchangeStatus;
}

/// Shared state used by all exchange implementations
pub struct ExchangeBase {
    pub name: String,
    pub kind: ExchangeKind,
    pub cache: Arc<OrderBookCache>,
    events: broadcast::Sender<ExchangeEvent>,
    connected: AtomicBool,
    subscriptions: RwLock<HashSet<String>>,
    stream: Mutex<Option<WsHandle>>,
}

impl ExchangeBase {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            name: name.to_string(),
            kind,
            cache: Arc::new(OrderBookCache::new()),
            events,
            connected: AtomicBool::new(false),
            subscriptions: RwLock::new(HashSet::new()),
            stream: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    /// Publish an event. No receivers is not an error.
    pub fn publish(&self, event: ExchangeEvent) {
        let _ = self.events.send(event);
    }

    pub fn publish_book(&self, symbol: &str) {
        self.publish(ExchangeEvent::OrderBookUpdated {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
        });
    }

    pub fn publish_price(&self, symbol: &str, price: f64) {
        self.publish(ExchangeEvent::PriceUpdated {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            price,
        });
    }

    pub fn notify_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("[{}] {}", self.name, message);
        self.publish(ExchangeEvent::Error {
            exchange: self.name.clone(),
            message,
        });
    }

    /// Record a subscription. Returns false if it already existed.
    pub fn add_subscription(&self, symbol: &str) -> bool {
        self.cache.register(symbol);
        self.subscriptions.write().insert(symbol.to_string())
    }

    pub fn remove_subscription(&self, symbol: &str) -> bool {
        self.cache.remove(symbol);
        self.subscriptions.write().remove(symbol)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut list: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        list.sort();
        list
    }

    /// Map a venue symbol ("ETHUSDT", "ETH-USDT") back to the subscribed "ETH/USDT"
    pub fn symbol_for(&self, venue_symbol: &str) -> Option<String> {
        let wanted = compact_symbol(&venue_symbol.replace('-', ""));
        self.subscriptions
            .read()
            .iter()
            .find(|s| compact_symbol(s) == wanted)
            .cloned()
    }

    pub fn set_stream(&self, handle: WsHandle) {
        if let Some(old) = self.stream.lock().replace(handle) {
            old.close();
        }
    }

    /// Send a frame on the live stream if one is open
    pub fn send_stream(&self, frame: String) -> bool {
        match self.stream.lock().as_ref() {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }

    pub fn stream_connected(&self) -> bool {
        self.stream
            .lock()
            .as_ref()
            .map(|h| h.stats().is_connected())
            .unwrap_or(false)
    }

    pub fn close_stream(&self) {
        if let Some(handle) = self.stream.lock().take() {
            handle.close();
        }
    }

    pub fn order_book(&self, symbol: &str) -> Option<OrderBook> {
        self.cache.get_order_book(symbol)
    }

    pub fn status(&self) -> ExchangeStatus {
        ExchangeStatus {
            name: self.name.clone(),
            kind: self.kind,
            connected: self.is_connected(),
            stream_connected: self.stream_connected(),
            subscriptions: self.subscriptions(),
            order_books: self.cache.symbols().len(),
        }
    }

    pub fn disconnect(&self) {
        self.close_stream();
        self.set_connected(false);
        info!("Disconnected from {}", self.name);
    }
}

/// Exchange-style symbol: "BTC/USDT" -> "BTCUSDT"
pub fn compact_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

/// Reconnect delay: `base * 2^(attempt-1)` capped at 30s, plus jitter
pub fn backoff_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(Duration::from_secs(30)) + jitter
}

/// Build the configured default exchange
pub fn create_exchange(config: &AppConfig) -> Result<Arc<dyn ExchangeService>, ExchangeError> {
    let live = config.exchange.live_stream;
    let exchange: Arc<dyn ExchangeService> = match config.exchange.default.as_str() {
        "sushiswap" => Arc::new(SushiSwapExchange::new(live)),
        "binance" => Arc::new(BinanceExchange::new(&config.exchange.binance, live)),
        "kucoin" => Arc::new(KuCoinExchange::new(&config.exchange.kucoin, live)),
        other => return Err(ExchangeError::NotImplemented(other.to_string())),
    };
    Ok(exchange)
}

/// Parse `[[price, size], ...]` levels. Values may be strings or numbers.
pub(crate) fn parse_levels(value: Option<&serde_json::Value>, exchange: &str) -> Vec<OrderBookEntry> {
    let as_f64 = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        other => other.as_f64(),
    };
    value
        .and_then(|v| v.as_array())
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let parts = level.as_array()?;
                    let price = as_f64(parts.first()?)?;
                    let size = as_f64(parts.get(1)?)?;
                    OrderBookEntry::new(price, size, exchange).ok()
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn require_credentials(name: &str, creds: &Credentials) -> Result<(String, String), ExchangeError> {
    match (&creds.api_key, &creds.api_secret) {
        (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => Ok((key.clone(), secret.clone())),
        _ => Err(ExchangeError::MissingCredentials(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_at_30s() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3, Duration::ZERO), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 10, Duration::ZERO), Duration::from_secs(30));
        assert_eq!(
            backoff_delay(base, 2, Duration::from_millis(250)),
            Duration::from_millis(4250)
        );
    }

    #[test]
    fn test_parse_levels_mixed_formats() {
        let value = serde_json::json!([["100.5", "2"], [99.0, 1.5], ["bad", "1"], ["98", "-1"]]);
        let levels = parse_levels(Some(&value), "binance");
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 100.5);
        assert_eq!(levels[1].size, 1.5);
        assert!(parse_levels(None, "binance").is_empty());
    }

    #[test]
    fn test_compact_symbol() {
        assert_eq!(compact_symbol("eth/usdt"), "ETHUSDT");
    }

    #[test]
    fn test_base_subscriptions_and_events() {
        let base = ExchangeBase::new("test", ExchangeKind::Dex);
        let mut rx = base.events();
        assert!(base.add_subscription("ETH/USDT"));
        assert!(!base.add_subscription("ETH/USDT"));
        assert_eq!(base.subscriptions(), vec!["ETH/USDT".to_string()]);

        base.publish_price("ETH/USDT", 1950.0);
        match rx.try_recv().unwrap() {
            ExchangeEvent::PriceUpdated { symbol, price, .. } => {
                assert_eq!(symbol, "ETH/USDT");
                assert_eq!(price, 1950.0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(base.remove_subscription("ETH/USDT"));
        assert!(base.subscriptions().is_empty());
        assert!(!base.stream_connected());
    }

    #[test]
    fn test_create_exchange() {
        let mut config = AppConfig::default();
        assert_eq!(create_exchange(&config).unwrap().name(), "sushiswap");
        config.exchange.default = "bitbns".to_string();
        assert!(matches!(create_exchange(&config), Err(ExchangeError::NotImplemented(_))));
    }
}
