//! KuCoin (CEX) service

use super::auth::{kucoin_headers, timestamp_ms};
use super::ws_client::{self, WsConfig, WsListener};
use super::{
    ExchangeBase, ExchangeError, ExchangeEvent, ExchangeKind, ExchangeService, ExchangeStatus,
    parse_levels, require_credentials,
};
use crate::config::Credentials;
use crate::order_book::OrderBook;
use crate::types::{Candle, RecentTrade, Side, TradingPair};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const KUCOIN_API_URL: &str = "https://api.kucoin.com";
const EXCHANGE_NAME: &str = "kucoin";
const SUCCESS_CODE: &str = "200000";

/// "BTC/USDT" -> "BTC-USDT"
fn venue_symbol(symbol: &str) -> String {
    symbol.replace('/', "-").to_uppercase()
}

/// Map chart intervals ("1m", "1h") to KuCoin candle types ("1min", "1hour")
fn candle_type(interval: &str) -> String {
    let (count, unit) = interval.split_at(interval.len().saturating_sub(1));
    match unit {
        "m" => format!("{}min", count),
        "h" => format!("{}hour", count),
        "d" => format!("{}day", count),
        "w" => format!("{}week", count),
        _ => interval.to_string(),
    }
}

fn str_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ExchangeError> {
        if self.code != SUCCESS_CODE {
            return Err(ExchangeError::Api(format!(
                "code {}: {}",
                self.code,
                self.msg.unwrap_or_default()
            )));
        }
        self.data
            .ok_or_else(|| ExchangeError::Parse("response has no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulletData {
    token: String,
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceServer {
    endpoint: String,
    #[serde(default)]
    ping_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolData {
    symbol: String,
    base_currency: String,
    quote_currency: String,
    #[serde(default)]
    base_min_size: Option<String>,
    #[serde(default)]
    base_max_size: Option<String>,
    #[serde(default)]
    price_increment: Option<String>,
    #[serde(default = "default_true")]
    enable_trading: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Level2Data {
    #[serde(default)]
    sequence: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    bids: Value,
    asks: Value,
}

#[derive(Debug, Deserialize)]
struct HistoryTrade {
    sequence: String,
    price: String,
    size: String,
    side: String,
    /// Nanoseconds
    time: i64,
}

struct TickerStream {
    base: Arc<ExchangeBase>,
}

impl TickerStream {
    fn frame(kind: &str, symbol: &str) -> String {
        json!({
            "id": timestamp_ms(),
            "type": kind,
            "topic": format!("/market/ticker:{}", venue_symbol(symbol)),
            "privateChannel": false,
            "response": true,
        })
        .to_string()
    }
}

impl WsListener for TickerStream {
    fn on_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.base.notify_error(format!("Error processing message: {}", e));
                return;
            }
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("message") => {
                let Some(topic) = value.get("topic").and_then(|t| t.as_str()) else {
                    return;
                };
                let Some(venue) = topic.strip_prefix("/market/ticker:") else {
                    return;
                };
                let Some(symbol) = self.base.symbol_for(venue) else {
                    return;
                };
                let price = str_f64(value.get("data").and_then(|d| d.get("price")));
                if price > 0.0 {
                    self.base.publish_price(&symbol, price);
                }
            }
            Some("welcome") => debug!("KuCoin stream welcome"),
            Some("ack") | Some("pong") => {}
            Some("error") => self
                .base
                .notify_error(format!("Stream error: {}", value.get("data").unwrap_or(&Value::Null))),
            _ => {}
        }
    }

    fn subscription_frames(&self) -> Vec<String> {
        self.base
            .subscriptions()
            .iter()
            .map(|s| Self::frame("subscribe", s))
            .collect()
    }

    fn on_error(&self, error: &str) {
        self.base.notify_error(error.to_string());
    }
}

pub struct KuCoinExchange {
    base: Arc<ExchangeBase>,
    client: Client,
    api_url: String,
    credentials: Credentials,
    live_stream: bool,
}

impl KuCoinExchange {
    pub fn new(credentials: &Credentials, live_stream: bool) -> Self {
        Self {
            base: Arc::new(ExchangeBase::new(EXCHANGE_NAME, ExchangeKind::Cex)),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url: KUCOIN_API_URL.to_string(),
            credentials: credentials.clone(),
            live_stream,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ExchangeError> {
        let envelope: Envelope<T> = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        envelope.into_data()
    }

    /// Authenticated account probe
    async fn verify_account(&self) -> Result<(), ExchangeError> {
        let (api_key, api_secret) = require_credentials(EXCHANGE_NAME, &self.credentials)?;
        let passphrase = self
            .credentials
            .passphrase
            .clone()
            .ok_or_else(|| ExchangeError::MissingCredentials(EXCHANGE_NAME.to_string()))?;

        let endpoint = "/api/v1/accounts";
        let headers = kucoin_headers(&api_secret, &passphrase, timestamp_ms(), "GET", endpoint, "");
        let response = self
            .client
            .get(format!("{}{}", self.api_url, endpoint))
            .header("KC-API-KEY", api_key)
            .header("KC-API-SIGN", headers.signature)
            .header("KC-API-TIMESTAMP", headers.timestamp)
            .header("KC-API-PASSPHRASE", headers.passphrase)
            .header("KC-API-KEY-VERSION", "2")
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(()),
            401 | 403 => Err(ExchangeError::Auth("KuCoin rejected the API key".to_string())),
            429 => Err(ExchangeError::RateLimited(2)),
            code => Err(ExchangeError::Api(format!("account probe returned HTTP {}", code))),
        }
    }

    /// Public stream endpoint with its connect token
    async fn ws_endpoint(&self) -> Result<(String, Option<u64>), ExchangeError> {
        let envelope: Envelope<BulletData> = self
            .client
            .post(format!("{}/api/v1/bullet-public", self.api_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let bullet = envelope.into_data()?;
        let server = bullet
            .instance_servers
            .first()
            .ok_or_else(|| ExchangeError::Parse("no instance servers".to_string()))?;
        Ok((format!("{}?token={}", server.endpoint, bullet.token), server.ping_interval))
    }

    async fn open_stream(&self) -> Result<(), ExchangeError> {
        let (url, ping_ms) = self.ws_endpoint().await?;
        url::Url::parse(&url).map_err(|e| ExchangeError::ConnectionFailed(e.to_string()))?;

        let mut config = WsConfig::new(EXCHANGE_NAME, &url);
        config.ping_interval = Some(Duration::from_millis(ping_ms.unwrap_or(20_000)));
        let listener = Arc::new(TickerStream {
            base: Arc::clone(&self.base),
        });
        self.base.set_stream(ws_client::spawn(config, listener));
        Ok(())
    }
}

#[async_trait]
impl ExchangeService for KuCoinExchange {
    fn name(&self) -> &str {
        EXCHANGE_NAME
    }

    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Cex
    }

    async fn connect(&self, max_retries: u32) -> Result<(), ExchangeError> {
        if self.is_connected() {
            return Ok(());
        }

        let attempts = max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result = async {
                if self.credentials.is_configured() {
                    self.verify_account().await?;
                }
                if self.live_stream {
                    self.open_stream().await?;
                }
                Ok::<(), ExchangeError>(())
            }
            .await;

            match result {
                Ok(()) => {
                    self.base.set_connected(true);
                    info!("✅ Connected to KuCoin");
                    return Ok(());
                }
                Err(e @ ExchangeError::Auth(_)) | Err(e @ ExchangeError::MissingCredentials(_)) => {
                    self.base.notify_error(e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    self.base
                        .notify_error(format!("Failed to connect on attempt {}: {}", attempt, e));
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        Err(ExchangeError::ConnectionFailed(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
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
        let symbols: Vec<SymbolData> = self.get("/api/v1/symbols", &[]).await?;
        Ok(symbols
            .into_iter()
            .filter(|s| s.enable_trading)
            .map(|s| {
                let mut pair = TradingPair::new(&format!("{}/{}", s.base_currency, s.quote_currency));
                pair.id = s.symbol;
                pair.min_qty = s.base_min_size.and_then(|v| v.parse().ok()).unwrap_or(0.0);
                pair.max_qty = s.base_max_size.and_then(|v| v.parse().ok()).unwrap_or(0.0);
                pair.min_price = s.price_increment.and_then(|v| v.parse().ok()).unwrap_or(0.0);
                pair
            })
            .collect())
    }

    async fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<RecentTrade>, ExchangeError> {
        let trades: Vec<HistoryTrade> = match self
            .get("/api/v1/market/histories", &[("symbol", venue_symbol(symbol))])
            .await
        {
            Ok(trades) => trades,
            Err(e) => {
                self.base.notify_error(format!("Error getting recent trades: {}", e));
                return Ok(Vec::new());
            }
        };

        let mut trades: Vec<RecentTrade> = trades
            .into_iter()
            .map(|t| RecentTrade {
                id: t.sequence,
                price: t.price.parse().unwrap_or(0.0),
                amount: t.size.parse().unwrap_or(0.0),
                timestamp: Utc.timestamp_nanos(t.time),
                side: Side::parse(&t.side).unwrap_or(Side::Buy),
                symbol: symbol.to_string(),
            })
            .collect();
        let skip = trades.len().saturating_sub(limit);
        Ok(trades.split_off(skip))
    }

    async fn subscribe(&self, symbol: &str) -> Result<(), ExchangeError> {
        if !symbol.contains('/') {
            return Err(ExchangeError::InvalidSymbol(symbol.to_string()));
        }
        if !self.is_connected() {
            return Err(ExchangeError::NotConnected(EXCHANGE_NAME.to_string()));
        }
        if self.base.add_subscription(symbol)
            && self.live_stream
            && !self.base.send_stream(TickerStream::frame("subscribe", symbol))
        {
            warn!("KuCoin stream not open, {} will subscribe on connect", symbol);
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), ExchangeError> {
        if self.base.remove_subscription(symbol) && self.live_stream {
            self.base.send_stream(TickerStream::frame("unsubscribe", symbol));
        }
        Ok(())
    }

    async fn order_book(&self, symbol: &str) -> Result<Option<OrderBook>, ExchangeError> {
        let data: Level2Data = self
            .get("/api/v1/market/orderbook/level2_20", &[("symbol", venue_symbol(symbol))])
            .await?;

        let mut book = OrderBook::new(symbol);
        book.update(
            parse_levels(Some(&data.bids), EXCHANGE_NAME),
            parse_levels(Some(&data.asks), EXCHANGE_NAME),
            data.time,
            data.sequence.and_then(|s| s.parse().ok()),
        );
        if book.is_empty() {
            return Ok(None);
        }
        Ok(Some(book))
    }

    async fn candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let rows: Vec<Vec<String>> = self
            .get(
                "/api/v1/market/candles",
                &[("symbol", venue_symbol(symbol)), ("type", candle_type(interval))],
            )
            .await?;

        // Newest first on the wire
        let mut candles: Vec<Candle> = rows
            .iter()
            .take(limit)
            .map(|row| parse_candle(row))
            .collect::<Result<_, _>>()?;
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

/// `[time, open, close, high, low, volume, turnover]`, time in seconds
fn parse_candle(row: &[String]) -> Result<Candle, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::Parse(format!("candle has {} fields", row.len())));
    }
    let num = |i: usize| row[i].parse::<f64>().map_err(|e| ExchangeError::Parse(e.to_string()));
    let secs: i64 = row[0].parse().map_err(|_| ExchangeError::Parse(format!("bad time {}", row[0])))?;
    Ok(Candle {
        timestamp: Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| ExchangeError::Parse(format!("bad time {}", secs)))?,
        open: num(1)?,
        close: num(2)?,
        high: num(3)?,
        low: num(4)?,
        volume: num(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_and_interval_mapping() {
        assert_eq!(venue_symbol("btc/usdt"), "BTC-USDT");
        assert_eq!(candle_type("1m"), "1min");
        assert_eq!(candle_type("15m"), "15min");
        assert_eq!(candle_type("4h"), "4hour");
        assert_eq!(candle_type("1d"), "1day");
    }

    #[test]
    fn test_envelope_error_code() {
        let ok: Envelope<Vec<u32>> = serde_json::from_str(r#"{"code":"200000","data":[1,2]}"#).unwrap();
        assert_eq!(ok.into_data().unwrap(), vec![1, 2]);

        let err: Envelope<Vec<u32>> = serde_json::from_str(r#"{"code":"400100","msg":"bad symbol"}"#).unwrap();
        assert!(matches!(err.into_data(), Err(ExchangeError::Api(m)) if m.contains("bad symbol")));
    }

    #[test]
    fn test_parse_candle_column_order() {
        let row: Vec<String> = ["1545904980", "0.058", "0.049", "0.058", "0.049", "0.018", "0.000945"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let candle = parse_candle(&row).unwrap();
        assert_eq!(candle.open, 0.058);
        assert_eq!(candle.close, 0.049);
        assert_eq!(candle.high, 0.058);
        assert_eq!(candle.low, 0.049);
        assert_eq!(candle.timestamp.timestamp(), 1_545_904_980);
    }

    #[test]
    fn test_ticker_message_publishes_price() {
        let base = Arc::new(ExchangeBase::new(EXCHANGE_NAME, ExchangeKind::Cex));
        base.add_subscription("BTC/USDT");
        let mut events = base.events();
        let stream = TickerStream { base: Arc::clone(&base) };

        stream.on_message(
            r#"{"type":"message","topic":"/market/ticker:BTC-USDT","subject":"trade.ticker","data":{"price":"30123.5","size":"0.01"}}"#,
        );
        stream.on_message(r#"{"type":"message","topic":"/market/ticker:ETH-USDT","data":{"price":"1"}}"#);

        match events.try_recv().unwrap() {
            ExchangeEvent::PriceUpdated { symbol, price, exchange } => {
                assert_eq!(exchange, "kucoin");
                assert_eq!(symbol, "BTC/USDT");
                assert_eq!(price, 30123.5);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_subscription_frames_replay_all() {
        let base = Arc::new(ExchangeBase::new(EXCHANGE_NAME, ExchangeKind::Cex));
        base.add_subscription("ETH/USDT");
        base.add_subscription("BTC/USDT");
        let frames = TickerStream { base }.subscription_frames();
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["topic"], "/market/ticker:BTC-USDT");
        assert_eq!(first["privateChannel"], false);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let exchange = KuCoinExchange::new(&Credentials::default(), false);
        assert!(matches!(
            exchange.subscribe("BTC/USDT").await,
            Err(ExchangeError::NotConnected(_))
        ));
        assert!(matches!(
            exchange.subscribe("BTCUSDT").await,
            Err(ExchangeError::InvalidSymbol(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_connect_without_credentials() {
        // No credentials and no live stream means nothing to probe
        let exchange = KuCoinExchange::new(&Credentials::default(), false);
        exchange.connect(1).await.unwrap();
        assert!(exchange.is_connected());
        exchange.subscribe("BTC/USDT").await.unwrap();
        assert_eq!(exchange.status().subscriptions, vec!["BTC/USDT".to_string()]);
    }
}
