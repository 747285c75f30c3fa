//! Type definitions shared by the trading engine, exchanges and API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Signed multiplier applied to position size
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl OrderType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop_loss" => Some(OrderType::StopLoss),
            "take_profit" => Some(OrderType::TakeProfit),
            _ => None,
        }
    }

    /// Conditional orders rest until their trigger price is crossed
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::TakeProfit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopLoss => "stop_loss",
            OrderType::TakeProfit => "take_profit",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
}

/// Trading pair metadata (e.g., "BTC/USDT")
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingPair {
    pub symbol: String,
    pub id: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub last_price: f64,
    pub price_change_24h: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub min_qty: f64,
    pub max_qty: f64,
}

impl TradingPair {
    pub fn new(symbol: &str) -> Self {
        let (base, quote) = match symbol.split_once('/') {
            Some((b, q)) => (b.to_string(), q.to_string()),
            None => (String::new(), String::new()),
        };

        Self {
            symbol: symbol.to_string(),
            id: symbol.replace('/', ""),
            base_asset: base,
            quote_asset: quote,
            ..Default::default()
        }
    }

    /// Exchange-style symbol without separator ("BTCUSDT")
    pub fn compact(&self) -> String {
        self.symbol.replace('/', "")
    }
}

/// OHLCV candle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Public trade print
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentTrade {
    pub id: String,
    pub price: f64,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    /// Price the order actually executed at
    pub fill_price: Option<f64>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Open position. Size is signed: long positive, short negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(symbol: &str, size: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            size,
            entry_price: price,
            current_price: price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle state used by wallet, engine and services during startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    NotStarted,
    Starting,
    CheckingComponents,
    VerifyingHealth,
    SyncingPositions,
    VerifyingMarketData,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_pair_split() {
        let pair = TradingPair::new("BTC/USDT");
        assert_eq!(pair.base_asset, "BTC");
        assert_eq!(pair.quote_asset, "USDT");
        assert_eq!(pair.compact(), "BTCUSDT");

        let bad = TradingPair::new("BTCUSDT");
        assert!(bad.base_asset.is_empty());
        assert!(bad.quote_asset.is_empty());
    }

    #[test]
    fn test_order_type_parse() {
        assert_eq!(OrderType::parse("stop_loss"), Some(OrderType::StopLoss));
        assert_eq!(OrderType::parse("MARKET"), Some(OrderType::Market));
        assert_eq!(OrderType::parse("trailing"), None);
        assert!(OrderType::TakeProfit.is_conditional());
        assert!(!OrderType::Limit.is_conditional());
    }

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), -1.0);
        assert_eq!(Side::parse("Sell"), Some(Side::Sell));
        assert_eq!(Side::Buy.to_string(), "buy");
    }
}
