//! Binance (CEX) service
//!
//! REST for pairs, trades, klines and depth; public WebSocket for live
//! depth/trade updates; private user data stream (listen key) for order
//! execution reports.

use super::auth::{binance_signature, timestamp_ms};
use super::ws_client::{self, WsConfig, WsHandle, WsListener};
use super::{
    backoff_delay, compact_symbol, parse_levels, require_credentials, ExchangeBase, ExchangeError,
    ExchangeEvent, ExchangeKind, ExchangeService, ExchangeStatus,
};
use crate::config::Credentials;
use crate::order_book::OrderBook;
use crate::types::{Candle, Order, OrderStatus, OrderType, RecentTrade, Side, TradingPair};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BINANCE_API_URL: &str = "https://api.binance.com";
const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const EXCHANGE_NAME: &str = "binance";
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);
const DEPTH_LIMIT: usize = 20;

/// Result of probing an authenticated endpoint
#[derive(Debug)]
enum ProbeOutcome {
    Connected,
    RetryAfter(u64),
    Retry(String),
    Fatal(ExchangeError),
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> ProbeOutcome {
    match status.as_u16() {
        200 => ProbeOutcome::Connected,
        429 => ProbeOutcome::RetryAfter(retry_after.unwrap_or(2)),
        418 => ProbeOutcome::Fatal(ExchangeError::Banned),
        401 | 403 => ProbeOutcome::Fatal(ExchangeError::Auth(
            "check your API credentials".to_string(),
        )),
        code => ProbeOutcome::Retry(format!("HTTP {} - {}", code, body)),
    }
}

fn retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn str_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<Value>,
}

impl SymbolInfo {
    fn into_pair(self) -> TradingPair {
        let mut pair = TradingPair::new(&format!("{}/{}", self.base_asset, self.quote_asset));
        pair.id = self.symbol;
        for filter in &self.filters {
            match filter.get("filterType").and_then(|t| t.as_str()) {
                Some("PRICE_FILTER") => {
                    pair.min_price = str_f64(filter.get("minPrice"));
                    pair.max_price = str_f64(filter.get("maxPrice"));
                }
                Some("LOT_SIZE") => {
                    pair.min_qty = str_f64(filter.get("minQty"));
                    pair.max_qty = str_f64(filter.get("maxQty"));
                }
                _ => {}
            }
        }
        pair
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceTrade {
    id: u64,
    price: String,
    qty: String,
    time: i64,
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthResponse {
    last_update_id: u64,
    bids: Value,
    asks: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

// ==========================================
// Public market stream
// ==========================================

struct PublicStream {
    base: Arc<ExchangeBase>,
}

impl PublicStream {
    fn frame(method: &str, symbols: &[String]) -> String {
        let params: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let sym = compact_symbol(s).to_lowercase();
                [format!("{}@trade", sym), format!("{}@depth@100ms", sym)]
            })
            .collect();
        json!({ "method": method, "params": params, "id": timestamp_ms() }).to_string()
    }
}

impl WsListener for PublicStream {
    fn on_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.base.notify_error(format!("Error handling message: {}", e));
                return;
            }
        };
        let Some(event) = value.get("e").and_then(|e| e.as_str()) else {
            return;
        };
        let Some(symbol) = value
            .get("s")
            .and_then(|s| s.as_str())
            .and_then(|s| self.base.symbol_for(s))
        else {
            return;
        };

        match event {
            "depthUpdate" => {
                let bids = parse_levels(value.get("b"), EXCHANGE_NAME);
                let asks = parse_levels(value.get("a"), EXCHANGE_NAME);
                let update_id = value.get("u").and_then(|u| u.as_u64());
                if self.base.cache.update_incremental(&symbol, bids, asks, update_id) {
                    self.base.publish_book(&symbol);
                }
            }
            "trade" => {
                let price = str_f64(value.get("p"));
                if price > 0.0 {
                    self.base.publish_price(&symbol, price);
                }
            }
            other => debug!("Ignoring Binance event {}", other),
        }
    }

    fn subscription_frames(&self) -> Vec<String> {
        let symbols = self.base.subscriptions();
        if symbols.is_empty() {
            Vec::new()
        } else {
            vec![Self::frame("SUBSCRIBE", &symbols)]
        }
    }

    fn on_error(&self, error: &str) {
        self.base.notify_error(format!("WebSocket error: {}", error));
    }
}

// ==========================================
// Private user data stream
// ==========================================

struct UserStreamListener {
    base: Arc<ExchangeBase>,
}

fn parse_execution_report(value: &Value, base: &ExchangeBase) -> Option<Order> {
    let venue_symbol = value.get("s")?.as_str()?;
    let symbol = base.symbol_for(venue_symbol).unwrap_or_else(|| venue_symbol.to_string());
    let side = Side::parse(value.get("S")?.as_str()?)?;
    let order_type = match value.get("o").and_then(|o| o.as_str()).unwrap_or("MARKET") {
        "LIMIT" | "LIMIT_MAKER" => OrderType::Limit,
        "STOP_LOSS" | "STOP_LOSS_LIMIT" => OrderType::StopLoss,
        "TAKE_PROFIT" | "TAKE_PROFIT_LIMIT" => OrderType::TakeProfit,
        _ => OrderType::Market,
    };
    let status = match value.get("X").and_then(|x| x.as_str()).unwrap_or("NEW") {
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "REJECTED" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    };
    let price = str_f64(value.get("p"));
    let last_price = str_f64(value.get("L"));
    let trigger = str_f64(value.get("P"));

    Some(Order {
        id: value.get("i").map(|i| i.to_string()).unwrap_or_default(),
        symbol,
        side,
        order_type,
        quantity: str_f64(value.get("q")),
        price: (price > 0.0).then_some(price),
        trigger_price: (trigger > 0.0).then_some(trigger),
        fill_price: (last_price > 0.0).then_some(last_price),
        status,
        timestamp: value
            .get("E")
            .and_then(|e| e.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now),
    })
}

impl WsListener for UserStreamListener {
    fn on_message(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return;
        };
        match value.get("e").and_then(|e| e.as_str()) {
            Some("executionReport") => {
                if let Some(order) = parse_execution_report(&value, &self.base) {
                    debug!("Execution report for order {} ({:?})", order.id, order.status);
                    self.base.publish(ExchangeEvent::OrderUpdated(order));
                }
            }
            Some("listenKeyExpired") => {
                self.base.notify_error("Listen key expired");
            }
            Some(other) => debug!("User stream event {}", other),
            None => {}
        }
    }

    fn on_error(&self, error: &str) {
        self.base.notify_error(format!("User stream error: {}", error));
    }
}

/// Private user data stream bound to a listen key
pub struct BinanceUserStream {
    listen_key: String,
    handle: WsHandle,
    keepalive: JoinHandle<()>,
}

impl BinanceUserStream {
    async fn create_listen_key(client: &Client, api_url: &str, api_key: &str) -> Result<String, ExchangeError> {
        let response = client
            .post(format!("{}/api/v3/userDataStream", api_url))
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<ListenKeyResponse>().await?.listen_key),
            StatusCode::TOO_MANY_REQUESTS => Err(ExchangeError::RateLimited(retry_after(&response).unwrap_or(60))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ExchangeError::Api(format!("listenKey request failed: {} - {}", status, body)))
            }
        }
    }

    async fn start(
        client: Client,
        api_url: &str,
        ws_url: &str,
        api_key: &str,
        base: Arc<ExchangeBase>,
    ) -> Result<Self, ExchangeError> {
        let listen_key = Self::create_listen_key(&client, api_url, api_key).await?;
        info!("Obtained Binance listen key");

        let mut config = WsConfig::new("binance-user", &format!("{}/{}", ws_url, listen_key));
        config.max_reconnect_attempts = 5;
        let handle = ws_client::spawn(config, Arc::new(UserStreamListener { base: Arc::clone(&base) }));

        let keepalive_url = format!("{}/api/v3/userDataStream", api_url);
        let key = listen_key.clone();
        let api_key = api_key.to_string();
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = client
                    .put(&keepalive_url)
                    .header("X-MBX-APIKEY", &api_key)
                    .query(&[("listenKey", &key)])
                    .send()
                    .await;
                match result {
                    Ok(r) if r.status().is_success() => debug!("Refreshed Binance listen key"),
                    Ok(r) => base.notify_error(format!("Failed to refresh listen key: {}", r.status())),
                    Err(e) => base.notify_error(format!("Failed to refresh listen key: {}", e)),
                }
            }
        });

        Ok(Self {
            listen_key,
            handle,
            keepalive,
        })
    }

    pub fn listen_key(&self) -> &str {
        &self.listen_key
    }

    pub fn stop(&self) {
        self.keepalive.abort();
        self.handle.close();
    }
}

// ==========================================
// Exchange service
// ==========================================

pub struct BinanceExchange {
    base: Arc<ExchangeBase>,
    client: Client,
    api_url: String,
    ws_url: String,
    credentials: Credentials,
    live_stream: bool,
    user_stream: parking_lot::Mutex<Option<BinanceUserStream>>,
}

impl BinanceExchange {
    pub fn new(credentials: &Credentials, live_stream: bool) -> Self {
        Self {
            base: Arc::new(ExchangeBase::new(EXCHANGE_NAME, ExchangeKind::Cex)),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url: BINANCE_API_URL.to_string(),
            ws_url: BINANCE_WS_URL.to_string(),
            credentials: credentials.clone(),
            live_stream,
            user_stream: parking_lot::Mutex::new(None),
        }
    }

    async fn probe_account(&self, api_key: &str, api_secret: &str) -> Result<ProbeOutcome, ExchangeError> {
        let query = format!("timestamp={}", timestamp_ms());
        let signature = binance_signature(api_secret, &query);
        let response = self
            .client
            .get(format!("{}/api/v3/account?{}&signature={}", self.api_url, query, signature))
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;
        let status = response.status();
        let retry = retry_after(&response);
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        Ok(classify_status(status, retry, &body))
    }

    async fn start_streams(&self, api_key: &str) -> Result<(), ExchangeError> {
        let user_stream = BinanceUserStream::start(
            self.client.clone(),
            &self.api_url,
            &self.ws_url,
            api_key,
            Arc::clone(&self.base),
        )
        .await?;
        if let Some(old) = self.user_stream.lock().replace(user_stream) {
            old.stop();
        }

        if self.live_stream {
            let listener = Arc::new(PublicStream {
                base: Arc::clone(&self.base),
            });
            self.base
                .set_stream(ws_client::spawn(WsConfig::new(EXCHANGE_NAME, &self.ws_url), listener));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeService for BinanceExchange {
    fn name(&self) -> &str {
        EXCHANGE_NAME
    }

    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Cex
    }

    async fn connect(&self, max_retries: u32) -> Result<(), ExchangeError> {
        let (api_key, api_secret) = require_credentials(EXCHANGE_NAME, &self.credentials)?;
        if self.is_connected() {
            return Ok(());
        }

        for attempt in 0..max_retries.max(1) {
            let outcome = match self.probe_account(&api_key, &api_secret).await {
                Ok(outcome) => outcome,
                Err(e) => ProbeOutcome::Retry(format!("Network error: {}", e)),
            };

            match outcome {
                ProbeOutcome::Connected => {
                    self.start_streams(&api_key).await?;
                    self.base.set_connected(true);
                    info!("✅ Connected to Binance");
                    return Ok(());
                }
                ProbeOutcome::Fatal(e) => {
                    self.base.notify_error(e.to_string());
                    return Err(e);
                }
                ProbeOutcome::RetryAfter(secs) => {
                    self.base
                        .notify_error(format!("Rate limit exceeded. Waiting {} seconds before retry", secs));
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
                ProbeOutcome::Retry(reason) => {
                    self.base.notify_error(format!("Connection failed: {}", reason));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    tokio::time::sleep(backoff_delay(Duration::from_secs(2), attempt + 1, jitter)).await;
                }
            }
        }

        let message = format!("Failed to connect after {} attempts", max_retries);
        self.base.notify_error(message.clone());
        Err(ExchangeError::ConnectionFailed(message))
    }

    async fn disconnect(&self) {
        if let Some(stream) = self.user_stream.lock().take() {
            stream.stop();
        }
        self.base.disconnect();
        for symbol in self.base.subscriptions() {
            self.base.remove_subscription(&symbol);
        }
    }

    fn is_connected(&self) -> bool {
        self.base.is_connected()
    }

    async fn available_pairs(&self) -> Result<Vec<TradingPair>, ExchangeError> {
        let info: ExchangeInfoResponse = self
            .client
            .get(format!("{}/api/v3/exchangeInfo", self.api_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING")
            .map(SymbolInfo::into_pair)
            .collect())
    }

    async fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<RecentTrade>, ExchangeError> {
        let trades: Vec<BinanceTrade> = self
            .client
            .get(format!("{}/api/v3/trades", self.api_url))
            .query(&[("symbol", compact_symbol(symbol)), ("limit", limit.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(trades
            .into_iter()
            .map(|t| RecentTrade {
                id: t.id.to_string(),
                price: t.price.parse().unwrap_or(0.0),
                amount: t.qty.parse().unwrap_or(0.0),
                timestamp: Utc.timestamp_millis_opt(t.time).single().unwrap_or_else(Utc::now),
                // Buyer was the maker, so the aggressor sold
                side: if t.is_buyer_maker { Side::Sell } else { Side::Buy },
                symbol: symbol.to_string(),
            })
            .collect())
    }

    async fn subscribe(&self, symbol: &str) -> Result<(), ExchangeError> {
        if !symbol.contains('/') {
            return Err(ExchangeError::InvalidSymbol(symbol.to_string()));
        }
        if self.base.add_subscription(symbol) && self.live_stream {
            if !self.base.send_stream(PublicStream::frame("SUBSCRIBE", &[symbol.to_string()])) {
                warn!("Binance stream not open, {} will subscribe on connect", symbol);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), ExchangeError> {
        if self.base.remove_subscription(symbol) && self.live_stream {
            self.base
                .send_stream(PublicStream::frame("UNSUBSCRIBE", &[symbol.to_string()]));
        }
        Ok(())
    }

    async fn order_book(&self, symbol: &str) -> Result<Option<OrderBook>, ExchangeError> {
        if let Some(book) = self.base.order_book(symbol) {
            return Ok(Some(book));
        }

        let depth: DepthResponse = self
            .client
            .get(format!("{}/api/v3/depth", self.api_url))
            .query(&[("symbol", compact_symbol(symbol)), ("limit", DEPTH_LIMIT.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut book = OrderBook::new(symbol);
        book.update(
            parse_levels(Some(&depth.bids), EXCHANGE_NAME),
            parse_levels(Some(&depth.asks), EXCHANGE_NAME),
            None,
            Some(depth.last_update_id),
        );
        Ok(Some(book))
    }

    async fn candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let rows: Vec<Vec<Value>> = self
            .client
            .get(format!("{}/api/v3/klines", self.api_url))
            .query(&[
                ("symbol", compact_symbol(symbol)),
                ("interval", interval.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.base.events()
    }

    fn status(&self) -> ExchangeStatus {
        self.base.status()
    }
}

fn parse_kline(row: &[Value]) -> Result<Candle, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::Parse(format!("kline has {} fields", row.len())));
    }
    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| ExchangeError::Parse("kline open time".to_string()))?;
    Ok(Candle {
        timestamp: Utc
            .timestamp_millis_opt(open_time)
            .single()
            .ok_or_else(|| ExchangeError::Parse(format!("bad timestamp {}", open_time)))?,
        open: str_f64(row.get(1)),
        high: str_f64(row.get(2)),
        low: str_f64(row.get(3)),
        close: str_f64(row.get(4)),
        volume: str_f64(row.get(5)),
    })
}
