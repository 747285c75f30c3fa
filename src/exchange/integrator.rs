//! Multi-exchange aggregation
//!
//! Holds one service per venue, connects them concurrently and answers
//! cross-venue queries (merged book, best price).

use super::{BinanceExchange, ExchangeError, ExchangeKind, ExchangeService, KuCoinExchange, SushiSwapExchange};
use crate::config::Credentials;
use crate::order_book::OrderBook;
use crate::types::{Side, TradingPair};

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const AGGREGATED_DEPTH: usize = 20;

/// Venue registration
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Pairs to subscribe after connecting. Empty subscribes every listed pair.
    #[serde(default)]
    pub symbols: Vec<String>,
}

pub struct ExchangeIntegrator {
    exchanges: DashMap<String, Arc<dyn ExchangeService>>,
    watchlists: DashMap<String, Vec<String>>,
    trading_pairs: DashMap<String, HashMap<String, TradingPair>>,
    connection_status: DashMap<String, bool>,
    connected: AtomicBool,
    live_stream: bool,
}

impl ExchangeIntegrator {
    pub fn new(live_stream: bool) -> Self {
        Self {
            exchanges: DashMap::new(),
            watchlists: DashMap::new(),
            trading_pairs: DashMap::new(),
            connection_status: DashMap::new(),
            connected: AtomicBool::new(false),
            live_stream,
        }
    }

    pub fn add_exchange(&self, info: ExchangeInfo) -> Result<(), ExchangeError> {
        let exchange: Arc<dyn ExchangeService> = match info.kind {
            ExchangeKind::Dex => Arc::new(
                SushiSwapExchange::new(self.live_stream).with_endpoints(&info.base_url, &info.ws_url),
            ),
            ExchangeKind::Cex => match info.name.to_lowercase().as_str() {
                "binance" => Arc::new(BinanceExchange::new(&info.credentials, self.live_stream)),
                "kucoin" => Arc::new(KuCoinExchange::new(&info.credentials, self.live_stream)),
                _ => return Err(ExchangeError::NotImplemented(info.name)),
            },
        };

        info!("Added exchange {} ({:?})", info.name, info.kind);
        self.watchlists.insert(info.name.clone(), info.symbols);
        self.trading_pairs.insert(info.name.clone(), HashMap::new());
        self.connection_status.insert(info.name.clone(), false);
        self.exchanges.insert(info.name, exchange);
        Ok(())
    }

    /// Register an already constructed service
    pub fn insert_service(&self, name: &str, exchange: Arc<dyn ExchangeService>) {
        self.trading_pairs.insert(name.to_string(), HashMap::new());
        self.connection_status.insert(name.to_string(), false);
        self.exchanges.insert(name.to_string(), exchange);
    }

    pub fn exchange(&self, name: &str) -> Option<Arc<dyn ExchangeService>> {
        self.exchanges.get(name).map(|e| Arc::clone(e.value()))
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn ExchangeService>)> {
        self.exchanges
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    async fn connect_one(
        &self,
        name: &str,
        exchange: &Arc<dyn ExchangeService>,
        max_retries: u32,
    ) -> Result<(), ExchangeError> {
        exchange.connect(max_retries).await?;

        let pairs = exchange.available_pairs().await?;
        let watchlist = self.watchlists.get(name).map(|w| w.clone()).unwrap_or_default();
        let targets: Vec<String> = if watchlist.is_empty() {
            pairs.iter().map(|p| p.symbol.clone()).collect()
        } else {
            watchlist
        };
        self.trading_pairs
            .insert(name.to_string(), pairs.into_iter().map(|p| (p.symbol.clone(), p)).collect());

        for symbol in targets {
            exchange.subscribe(&symbol).await?;
        }
        Ok(())
    }

    /// Connect every venue concurrently. Returns per-exchange success.
    pub async fn connect_all(&self, max_retries: u32) -> HashMap<String, bool> {
        let exchanges = self.snapshot();
        let results = join_all(exchanges.iter().map(|(name, exchange)| async move {
            let result = self.connect_one(name, exchange, max_retries).await;
            if let Err(e) = &result {
                error!("Error connecting to {}: {}", name, e);
            }
            (name.clone(), result.is_ok())
        }))
        .await;

        for (name, ok) in &results {
            self.connection_status.insert(name.clone(), *ok);
        }
        let all_ok = !results.is_empty() && results.iter().all(|(_, ok)| *ok);
        self.connected.store(all_ok, Ordering::SeqCst);
        results.into_iter().collect()
    }

    pub async fn disconnect_all(&self) {
        for (name, exchange) in self.snapshot() {
            exchange.disconnect().await;
            self.connection_status.insert(name, false);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connection_status(&self) -> HashMap<String, bool> {
        self.connection_status
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    async fn books(&self, symbol: &str) -> Vec<OrderBook> {
        let mut books = Vec::new();
        for (name, exchange) in self.snapshot() {
            match exchange.order_book(symbol).await {
                Ok(Some(book)) => books.push(book),
                Ok(None) => {}
                Err(e) => warn!("Error getting order book from {}: {}", name, e),
            }
        }
        books
    }

    /// Merge every venue's book for `symbol`
    pub async fn aggregated_order_book(&self, symbol: &str) -> Option<OrderBook> {
        let books = self.books(symbol).await;
        let (bids, asks): (Vec<_>, Vec<_>) = books.into_iter().map(|b| (b.bids, b.asks)).unzip();
        let bids: Vec<_> = bids.into_iter().flatten().collect();
        let asks: Vec<_> = asks.into_iter().flatten().collect();
        if bids.is_empty() && asks.is_empty() {
            return None;
        }

        let mut book = OrderBook::with_depth(symbol, AGGREGATED_DEPTH);
        book.update(bids, asks, None, None);
        Some(book)
    }

    /// Lowest ask for a buy, highest bid for a sell
    pub async fn best_price(&self, symbol: &str, side: Side) -> Option<f64> {
        let prices = self.books(symbol).await.into_iter().filter_map(|b| match side {
            Side::Buy => b.best_ask(),
            Side::Sell => b.best_bid(),
        });
        match side {
            Side::Buy => prices.reduce(f64::min),
            Side::Sell => prices.reduce(f64::max),
        }
    }

    /// Pairs for one exchange, or the union across all of them
    pub fn trading_pairs(&self, exchange: Option<&str>) -> HashMap<String, TradingPair> {
        match exchange {
            Some(name) => self.trading_pairs.get(name).map(|p| p.clone()).unwrap_or_default(),
            None => {
                let mut all = HashMap::new();
                for entry in self.trading_pairs.iter() {
                    all.extend(entry.value().iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                all
            }
        }
    }

    pub fn supported_exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exchanges.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dex(name: &str) -> ExchangeInfo {
        ExchangeInfo {
            name: name.to_string(),
            kind: ExchangeKind::Dex,
            base_url: String::new(),
            ws_url: String::new(),
            credentials: Credentials::default(),
            symbols: Vec::new(),
        }
    }

    #[test]
    fn test_add_exchange_kinds() {
        let integrator = ExchangeIntegrator::new(false);
        integrator.add_exchange(dex("sushiswap")).unwrap();

        let mut cex = dex("binance");
        cex.kind = ExchangeKind::Cex;
        integrator.add_exchange(cex).unwrap();

        let mut unknown = dex("bitbns");
        unknown.kind = ExchangeKind::Cex;
        assert!(matches!(
            integrator.add_exchange(unknown),
            Err(ExchangeError::NotImplemented(_))
        ));
        assert_eq!(integrator.supported_exchanges(), vec!["binance", "sushiswap"]);
    }

    #[tokio::test]
    async fn test_connect_all_reports_per_exchange() {
        let integrator = ExchangeIntegrator::new(false);
        integrator.add_exchange(dex("sushiswap")).unwrap();
        let mut binance = dex("binance");
        binance.kind = ExchangeKind::Cex;
        integrator.add_exchange(binance).unwrap();

        let status = integrator.connect_all(1).await;
        assert_eq!(status.get("sushiswap"), Some(&true));
        // No credentials configured
        assert_eq!(status.get("binance"), Some(&false));
        assert!(!integrator.is_connected());

        let pairs = integrator.trading_pairs(Some("sushiswap"));
        assert_eq!(pairs.len(), 3);
        assert!(integrator.trading_pairs(Some("binance")).is_empty());
        assert_eq!(integrator.trading_pairs(None).len(), 3);
    }

    #[tokio::test]
    async fn test_aggregated_book_and_best_price() {
        let integrator = ExchangeIntegrator::new(false);
        integrator.add_exchange(dex("sushi-a")).unwrap();
        integrator.add_exchange(dex("sushi-b")).unwrap();

        let book = integrator.aggregated_order_book("ETH/USDT").await.unwrap();
        assert_eq!(book.bids.len(), 10);
        assert_eq!(book.best_bid(), Some(1950.0));
        assert!(book.bids.windows(2).all(|w| w[0].price >= w[1].price));

        assert_eq!(integrator.best_price("ETH/USDT", Side::Buy).await, Some(1950.0));
        assert_eq!(integrator.best_price("ETH/USDT", Side::Sell).await, Some(1950.0));
    }

    #[tokio::test]
    async fn test_empty_integrator() {
        let integrator = ExchangeIntegrator::new(false);
        assert!(integrator.aggregated_order_book("ETH/USDT").await.is_none());
        assert!(integrator.best_price("ETH/USDT", Side::Buy).await.is_none());
        assert!(integrator.connect_all(1).await.is_empty());
        assert!(!integrator.is_connected());
    }
}
