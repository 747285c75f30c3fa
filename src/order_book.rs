//! Order books and the per-exchange order book cache

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_DEPTH: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum OrderBookError {
    #[error("Price and size must be non-negative (price={price}, size={size})")]
    NegativeValue { price: f64, size: f64 },
    #[error("Exchange name is required")]
    MissingExchange,
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
}

/// A single price level tagged with its source exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookEntry {
    pub price: f64,
    pub size: f64,
    pub exchange: String,
}

impl OrderBookEntry {
    pub fn new(price: f64, size: f64, exchange: &str) -> Result<Self, OrderBookError> {
        if price < 0.0 || size < 0.0 || price.is_nan() || size.is_nan() {
            return Err(OrderBookError::NegativeValue { price, size });
        }
        if exchange.is_empty() {
            return Err(OrderBookError::MissingExchange);
        }
        Ok(Self {
            price,
            size,
            exchange: exchange.to_string(),
        })
    }

    /// Build an entry from exchange wire strings ("30000.10", "0.5")
    pub fn from_strings(price: &str, size: &str, exchange: &str) -> Result<Self, OrderBookError> {
        let price = price
            .parse::<f64>()
            .map_err(|_| OrderBookError::InvalidNumber(price.to_string()))?;
        let size = size
            .parse::<f64>()
            .map_err(|_| OrderBookError::InvalidNumber(size.to_string()))?;
        Self::new(price, size, exchange)
    }
}

/// Aggregate volume over the top levels of a book
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookVolume {
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub total_volume: f64,
}

/// Serializable view of a book, prices and sizes as strings
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    pub timestamp: i64,
}

/// Depth-limited order book for one symbol
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<OrderBookEntry>,
    pub asks: Vec<OrderBookEntry>,
    pub timestamp_ms: i64,
    pub last_update_id: u64,
    pub max_depth: usize,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        Self::with_depth(symbol, DEFAULT_MAX_DEPTH)
    }

    pub fn with_depth(symbol: &str, max_depth: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp_ms: Utc::now().timestamp_millis(),
            last_update_id: 0,
            max_depth,
        }
    }

    fn is_stale(&self, update_id: Option<u64>) -> bool {
        matches!(update_id, Some(id) if id <= self.last_update_id)
    }

    /// Replace the book contents. Returns false when the update id is stale.
    pub fn update(
        &mut self,
        bids: Vec<OrderBookEntry>,
        asks: Vec<OrderBookEntry>,
        timestamp_ms: Option<i64>,
        update_id: Option<u64>,
    ) -> bool {
        if self.is_stale(update_id) {
            debug!("Ignoring stale update {:?} for {}", update_id, self.symbol);
            return false;
        }

        let mut bids: Vec<OrderBookEntry> = bids.into_iter().filter(|e| e.size > 0.0).collect();
        let mut asks: Vec<OrderBookEntry> = asks.into_iter().filter(|e| e.size > 0.0).collect();

        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        bids.truncate(self.max_depth);
        asks.truncate(self.max_depth);

        self.bids = bids;
        self.asks = asks;
        self.timestamp_ms = timestamp_ms.unwrap_or_else(|| Utc::now().timestamp_millis());
        if let Some(id) = update_id {
            self.last_update_id = id;
        }
        true
    }

    /// Apply incremental level changes. Size 0 removes a level.
    pub fn apply_delta(
        &mut self,
        bids: Vec<OrderBookEntry>,
        asks: Vec<OrderBookEntry>,
        update_id: Option<u64>,
    ) -> bool {
        if self.is_stale(update_id) {
            return false;
        }

        for level in bids {
            Self::apply_level_update(&mut self.bids, level, true);
        }
        for level in asks {
            Self::apply_level_update(&mut self.asks, level, false);
        }
        self.bids.truncate(self.max_depth);
        self.asks.truncate(self.max_depth);

        self.timestamp_ms = Utc::now().timestamp_millis();
        if let Some(id) = update_id {
            self.last_update_id = id;
        }
        true
    }

    fn apply_level_update(levels: &mut Vec<OrderBookEntry>, update: OrderBookEntry, is_bid: bool) {
        let pos = levels.iter().position(|l| {
            let max_price = l.price.abs().max(update.price.abs());
            if max_price < 1e-10 {
                (l.price - update.price).abs() < 1e-15
            } else {
                (l.price - update.price).abs() / max_price < 1e-9
            }
        });

        if update.size == 0.0 {
            if let Some(idx) = pos {
                levels.remove(idx);
            }
        } else if let Some(idx) = pos {
            levels[idx].size = update.size;
        } else {
            let insert_pos = if is_bid {
                levels.iter().position(|l| l.price < update.price).unwrap_or(levels.len())
            } else {
                levels.iter().position(|l| l.price > update.price).unwrap_or(levels.len())
            };
            levels.insert(insert_pos, update);
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Ask minus bid, 0 when either side is missing
    pub fn spread(&self) -> f64 {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => ask - bid,
            _ => 0.0,
        }
    }

    pub fn mid_price(&self) -> f64 {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => (bid + ask) / 2.0,
            _ => 0.0,
        }
    }

    /// Volume over the first `levels` levels of each side (default: full depth)
    pub fn volume(&self, levels: Option<usize>) -> BookVolume {
        let n = levels.unwrap_or(self.max_depth);
        let bid_volume: f64 = self.bids.iter().take(n).map(|l| l.size).sum();
        let ask_volume: f64 = self.asks.iter().take(n).map(|l| l.size).sum();
        BookVolume {
            bid_volume,
            ask_volume,
            total_volume: bid_volume + ask_volume,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn staleness_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.timestamp_ms
    }

    pub fn snapshot(&self) -> BookSnapshot {
        let levels = |side: &[OrderBookEntry]| {
            side.iter()
                .map(|l| [l.price.to_string(), l.size.to_string()])
                .collect()
        };
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids: levels(&self.bids),
            asks: levels(&self.asks),
            timestamp: self.timestamp_ms,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub books: usize,
    pub updates_received: u64,
    pub snapshots_received: u64,
    pub avg_staleness_ms: f64,
}

/// Thread-safe order book cache for one exchange
pub struct OrderBookCache {
    order_books: DashMap<String, Arc<RwLock<OrderBook>>>,
    max_depth: usize,
    stats: RwLock<CacheStats>,
}

impl OrderBookCache {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_MAX_DEPTH)
    }

    pub fn with_depth(max_depth: usize) -> Self {
        Self {
            order_books: DashMap::new(),
            max_depth,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Register an empty book for a symbol if none exists
    pub fn register(&self, symbol: &str) {
        self.order_books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::with_depth(symbol, self.max_depth))));
    }

    pub fn remove(&self, symbol: &str) {
        self.order_books.remove(symbol);
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.order_books.contains_key(symbol)
    }

    /// Replace a book from a snapshot, registering the symbol on first sight
    pub fn update_snapshot(
        &self,
        symbol: &str,
        bids: Vec<OrderBookEntry>,
        asks: Vec<OrderBookEntry>,
        timestamp_ms: Option<i64>,
        update_id: Option<u64>,
    ) -> bool {
        self.register(symbol);
        let applied = match self.order_books.get(symbol) {
            Some(book) => book.write().update(bids, asks, timestamp_ms, update_id),
            None => false,
        };
        self.stats.write().snapshots_received += 1;
        applied
    }

    pub fn update_incremental(
        &self,
        symbol: &str,
        bids: Vec<OrderBookEntry>,
        asks: Vec<OrderBookEntry>,
        update_id: Option<u64>,
    ) -> bool {
        self.register(symbol);
        let applied = match self.order_books.get(symbol) {
            Some(book) => book.write().apply_delta(bids, asks, update_id),
            None => false,
        };
        self.stats.write().updates_received += 1;
        applied
    }

    /// Get a book copy. Returns None if the book has no levels yet.
    pub fn get_order_book(&self, symbol: &str) -> Option<OrderBook> {
        self.order_books.get(symbol).and_then(|r| {
            let book = r.read().clone();
            if book.is_empty() {
                None
            } else {
                Some(book)
            }
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.order_books.iter().map(|r| r.key().clone()).collect()
    }

    pub fn is_fresh(&self, symbol: &str, max_staleness_ms: i64) -> bool {
        self.order_books
            .get(symbol)
            .map(|r| r.read().staleness_ms() < max_staleness_ms)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.books = self.order_books.len();
        let total: i64 = self.order_books.iter().map(|r| r.read().staleness_ms()).sum();
        stats.avg_staleness_ms = if stats.books > 0 {
            total as f64 / stats.books as f64
        } else {
            0.0
        };
        stats
    }

    pub fn clear(&self) {
        self.order_books.clear();
        *self.stats.write() = CacheStats::default();
        debug!("Order book cache cleared");
    }
}

impl Default for OrderBookCache {
    fn default() -> Self {
        Self::new()
    }
}
