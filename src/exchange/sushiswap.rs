//! SushiSwap (DEX) service
//!
//! Pairs, books and candles are simulated around fixed reference prices so
//! the application works offline. With `live_stream` enabled the depth
//! stream replaces the simulated book for subscribed symbols.

use super::ws_client::{self, WsConfig, WsListener};
use super::{
    auth::timestamp_ms, compact_symbol, parse_levels, ExchangeBase, ExchangeError, ExchangeEvent,
    ExchangeKind, ExchangeService, ExchangeStatus,
};
use crate::order_book::{OrderBook, OrderBookEntry};
use crate::types::{Candle, RecentTrade, Side, TradingPair};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const SUSHI_WS_URL: &str = "wss://stream.sushi.com/ws";
const SUSHI_API_URL: &str = "https://api.sushi.com/v1";
const EXCHANGE_NAME: &str = "sushiswap";
const SIMULATED_LEVELS: usize = 5;
const CANDLE_INTERVAL_MS: i64 = 60_000;
const MAX_SIMULATED_CANDLES: usize = 1000;

/// Reference price used for simulated market data
pub fn simulated_base_price(symbol: &str) -> f64 {
    let upper = symbol.to_uppercase();
    if upper.contains("ETH") {
        1950.0
    } else if upper.contains("BTC") {
        30000.0
    } else {
        15.0
    }
}

#[derive(Debug, Deserialize)]
struct SushiTrade {
    id: Option<Value>,
    price: Option<Value>,
    amount: Option<Value>,
    timestamp: Option<i64>,
    side: Option<String>,
}

fn value_f64(v: &Option<Value>) -> f64 {
    match v {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(other) => other.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

struct SushiStream {
    base: Arc<ExchangeBase>,
}

impl SushiStream {
    fn depth_frame(symbols: &[String], method: &str) -> String {
        let params: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@depth20@100ms", compact_symbol(s).to_lowercase()))
            .collect();
        json!({
            "method": method,
            "params": params,
            "id": timestamp_ms(),
        })
        .to_string()
    }

    fn handle_depth(&self, data: &Value) {
        let Some(venue_symbol) = data.get("s").and_then(|s| s.as_str()) else {
            return;
        };
        let Some(symbol) = self.base.symbol_for(venue_symbol) else {
            return;
        };

        let bids = parse_levels(data.get("b"), EXCHANGE_NAME);
        let asks = parse_levels(data.get("a"), EXCHANGE_NAME);
        let event_time = data.get("E").and_then(|v| v.as_i64());
        let update_id = data.get("u").and_then(|v| v.as_u64());

        if self.base.cache.update_snapshot(&symbol, bids, asks, event_time, update_id) {
            self.base.publish_book(&symbol);
            if let Some(book) = self.base.cache.get_order_book(&symbol) {
                let mid = book.mid_price();
                if mid > 0.0 {
                    self.base.publish_price(&symbol, mid);
                }
            }
        }
    }
}

impl WsListener for SushiStream {
    fn on_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.base.notify_error(format!("Failed to parse message: {}", e));
                return;
            }
        };

        if let (Some(stream), Some(data)) = (value.get("stream").and_then(|s| s.as_str()), value.get("data")) {
            if stream.contains("@depth") {
                self.handle_depth(data);
            }
        } else if value.get("result").is_some() {
            debug!("Subscription ack: {}", text);
        }
    }

    fn subscription_frames(&self) -> Vec<String> {
        let symbols = self.base.subscriptions();
        if symbols.is_empty() {
            Vec::new()
        } else {
            vec![Self::depth_frame(&symbols, "SUBSCRIBE")]
        }
    }

    fn on_connected(&self) {
        self.base.set_connected(true);
    }

    fn on_error(&self, error: &str) {
        self.base.notify_error(error.to_string());
    }
}

pub struct SushiSwapExchange {
    base: Arc<ExchangeBase>,
    client: Client,
    api_url: String,
    ws_url: String,
    live_stream: bool,
}

impl SushiSwapExchange {
    pub fn new(live_stream: bool) -> Self {
        Self {
            base: Arc::new(ExchangeBase::new(EXCHANGE_NAME, ExchangeKind::Dex)),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url: SUSHI_API_URL.to_string(),
            ws_url: SUSHI_WS_URL.to_string(),
            live_stream,
        }
    }

    /// Override REST and stream endpoints. Empty values keep the defaults.
    pub fn with_endpoints(mut self, api_url: &str, ws_url: &str) -> Self {
        if !api_url.is_empty() {
            self.api_url = api_url.trim_end_matches('/').to_string();
        }
        if !ws_url.is_empty() {
            self.ws_url = ws_url.to_string();
        }
        self
    }

    fn simulated_book(symbol: &str) -> Result<OrderBook, ExchangeError> {
        let base_price = simulated_base_price(symbol);
        let mut bids = Vec::with_capacity(SIMULATED_LEVELS);
        let mut asks = Vec::with_capacity(SIMULATED_LEVELS);
        for i in 0..SIMULATED_LEVELS {
            let step = i as f64;
            bids.push(
                OrderBookEntry::new(base_price - step * 0.1, 0.5 + step * 0.2, EXCHANGE_NAME)
                    .map_err(|e| ExchangeError::Parse(e.to_string()))?,
            );
            asks.push(
                OrderBookEntry::new(base_price + step * 0.1, 0.3 + step * 0.1, EXCHANGE_NAME)
                    .map_err(|e| ExchangeError::Parse(e.to_string()))?,
            );
        }
        let mut book = OrderBook::new(symbol);
        book.update(bids, asks, None, None);
        Ok(book)
    }

    fn spawn_stream(&self) -> Result<(), ExchangeError> {
        url::Url::parse(&self.ws_url).map_err(|e| ExchangeError::ConnectionFailed(e.to_string()))?;
        let listener = Arc::new(SushiStream {
            base: Arc::clone(&self.base),
        });
        let handle = ws_client::spawn(WsConfig::new(EXCHANGE_NAME, &self.ws_url), listener);
        self.base.set_stream(handle);
        Ok(())
    }
}

#[async_trait]
impl ExchangeService for SushiSwapExchange {
    fn name(&self) -> &str {
        EXCHANGE_NAME
    }

    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Dex
    }

    async fn connect(&self, max_retries: u32) -> Result<(), ExchangeError> {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            let result = if self.live_stream { self.spawn_stream() } else { Ok(()) };
            match result {
                Ok(()) => {
                    self.base.set_connected(true);
                    info!("Connected to SushiSwap on attempt {}", attempt);
                    return Ok(());
                }
                Err(e) => {
                    self.base
                        .notify_error(format!("Failed to connect to SushiSwap on attempt {}: {}", attempt, e));
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
        Err(ExchangeError::ConnectionFailed("max retries reached".to_string()))
    }

    async fn disconnect(&self) {
        self.base.disconnect();
        for symbol in self.base.subscriptions() {
            self.base.remove_subscription(&symbol);
        }
    }

    fn is_connected(&self) -> bool {
        self.base.is_connected()
    }

    async fn available_pairs(&self) -> Result<Vec<TradingPair>, ExchangeError> {
        Ok(["ETH/USDT", "BTC/USDT", "LINK/USDT"]
            .iter()
            .map(|symbol| {
                let mut pair = TradingPair::new(symbol);
                pair.last_price = simulated_base_price(symbol);
                pair.volume_24h = 1_000_000.0;
                pair.price_change_24h = 2.5;
                pair
            })
            .collect())
    }

    async fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<RecentTrade>, ExchangeError> {
        let url = format!("{}/trades/{}", self.api_url, compact_symbol(symbol));
        let response = self
            .client
            .get(&url)
            .query(&[("limit", limit)])
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let trades: Vec<SushiTrade> = match response {
            Ok(r) => r.json().await?,
            Err(e) => {
                self.base.notify_error(format!("Failed to fetch recent trades: {}", e));
                return Ok(Vec::new());
            }
        };

        Ok(trades
            .into_iter()
            .map(|t| RecentTrade {
                id: t.id.map(|v| v.to_string().trim_matches('"').to_string()).unwrap_or_default(),
                price: value_f64(&t.price),
                amount: value_f64(&t.amount),
                timestamp: t
                    .timestamp
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now),
                side: t.side.as_deref().and_then(Side::parse).unwrap_or(Side::Buy),
                symbol: symbol.to_string(),
            })
            .collect())
    }

    async fn subscribe(&self, symbol: &str) -> Result<(), ExchangeError> {
        if !symbol.contains('/') {
            return Err(ExchangeError::InvalidSymbol(symbol.to_string()));
        }
        if !self.is_connected() {
            self.connect(1).await?;
        }
        if !self.base.add_subscription(symbol) {
            return Ok(());
        }

        if self.live_stream {
            let frame = SushiStream::depth_frame(&[symbol.to_string()], "SUBSCRIBE");
            if !self.base.send_stream(frame) {
                warn!("SushiSwap stream not ready, {} will subscribe on connect", symbol);
            }
        } else {
            let book = Self::simulated_book(symbol)?;
            let mid = book.mid_price();
            self.base
                .cache
                .update_snapshot(symbol, book.bids, book.asks, None, None);
            self.base.publish_book(symbol);
            self.base.publish_price(symbol, mid);
        }
        info!("Subscribed to {} on SushiSwap", symbol);
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), ExchangeError> {
        if !self.base.remove_subscription(symbol) {
            return Ok(());
        }
        if self.live_stream {
            self.base
                .send_stream(SushiStream::depth_frame(&[symbol.to_string()], "UNSUBSCRIBE"));
        }
        if self.base.subscriptions().is_empty() {
            self.base.close_stream();
        }
        Ok(())
    }

    async fn order_book(&self, symbol: &str) -> Result<Option<OrderBook>, ExchangeError> {
        if let Some(book) = self.base.order_book(symbol) {
            return Ok(Some(book));
        }
        Ok(Some(Self::simulated_book(symbol)?))
    }

    async fn candles(&self, symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let base_price = simulated_base_price(symbol);
        let now = Utc::now().timestamp_millis();

        let mut candles: Vec<Candle> = (0..limit.min(MAX_SIMULATED_CANDLES))
            .map(|i| {
                let step = i as f64;
                let ts = now - i as i64 * CANDLE_INTERVAL_MS;
                Candle {
                    timestamp: Utc.timestamp_millis_opt(ts).single().unwrap_or_else(Utc::now),
                    open: base_price + step * 0.1,
                    high: base_price + step * 0.15,
                    low: base_price + step * 0.05,
                    close: base_price + step * 0.12,
                    volume: 1000.0 + step * 10.0,
                }
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.base.events()
    }

    fn status(&self) -> ExchangeStatus {
        self.base.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_pairs() {
        let exchange = SushiSwapExchange::new(false);
        let pairs = exchange.available_pairs().await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].symbol, "ETH/USDT");
        assert_eq!(pairs[0].last_price, 1950.0);
        assert_eq!(pairs[1].last_price, 30000.0);
        assert_eq!(pairs[2].last_price, 15.0);
    }

    #[tokio::test]
    async fn test_simulated_order_book() {
        let exchange = SushiSwapExchange::new(false);
        let book = exchange.order_book("BTC/USDT").await.unwrap().unwrap();
        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.best_bid(), Some(30000.0));
        assert_eq!(book.best_ask(), Some(30000.0));
        assert!((book.bids[4].price - 29999.6).abs() < 1e-9);
        assert!((book.asks[4].size - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_candles_chronological() {
        let exchange = SushiSwapExchange::new(false);
        let candles = exchange.candles("ETH/USDT", "1m", 10).await.unwrap();
        assert_eq!(candles.len(), 10);
        assert!(candles[0].timestamp < candles[9].timestamp);
        assert_eq!(candles[9].open, 1950.0);
        assert!((candles[0].close - (1950.0 + 9.0 * 0.12)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_candle_limit_capped() {
        let exchange = SushiSwapExchange::new(false);
        let candles = exchange.candles("ETH/USDT", "1m", 1_000_000_000).await.unwrap();
        assert_eq!(candles.len(), MAX_SIMULATED_CANDLES);
    }

    #[tokio::test]
    async fn test_subscribe_publishes_price() {
        let exchange = SushiSwapExchange::new(false);
        let mut events = exchange.subscribe_events();
        exchange.subscribe("LINK/USDT").await.unwrap();
        assert!(exchange.is_connected());
        assert_eq!(exchange.status().subscriptions, vec!["LINK/USDT".to_string()]);

        let mut saw_price = false;
        while let Ok(event) = events.try_recv() {
            if let ExchangeEvent::PriceUpdated { price, .. } = event {
                assert_eq!(price, 15.0);
                saw_price = true;
            }
        }
        assert!(saw_price);
        assert!(matches!(
            exchange.subscribe("LINKUSDT").await,
            Err(ExchangeError::InvalidSymbol(_))
        ));

        exchange.unsubscribe("LINK/USDT").await.unwrap();
        assert!(exchange.status().subscriptions.is_empty());
    }

    #[test]
    fn test_depth_message_updates_book() {
        let base = Arc::new(ExchangeBase::new(EXCHANGE_NAME, ExchangeKind::Dex));
        base.add_subscription("ETH/USDT");
        let stream = SushiStream { base: Arc::clone(&base) };

        stream.on_message(
            r#"{"stream":"ethusdt@depth20@100ms","data":{"s":"ETHUSDT","b":[["1949.5","2"]],"a":[["1950.5","1"]],"E":1700000000000,"u":7}}"#,
        );
        let book = base.order_book("ETH/USDT").unwrap();
        assert_eq!(book.best_bid(), Some(1949.5));
        assert_eq!(book.last_update_id, 7);
        assert_eq!(book.timestamp_ms, 1_700_000_000_000);

        // Stale id is dropped
        stream.on_message(
            r#"{"stream":"ethusdt@depth20@100ms","data":{"s":"ETHUSDT","b":[["1.0","2"]],"a":[],"u":7}}"#,
        );
        assert_eq!(base.order_book("ETH/USDT").unwrap().best_bid(), Some(1949.5));
    }

    #[tokio::test]
    async fn test_custom_endpoint_validated_on_connect() {
        let exchange = SushiSwapExchange::new(true).with_endpoints("", "not a url");
        assert!(exchange.connect(1).await.is_err());
        assert!(!exchange.is_connected());
    }

    #[test]
    fn test_depth_frame() {
        let frame: Value = serde_json::from_str(&SushiStream::depth_frame(&["ETH/USDT".to_string()], "SUBSCRIBE")).unwrap();
        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["params"][0], "ethusdt@depth20@100ms");
    }
}
