//! Auto trader - indicator-driven smart trades and cross-pair arbitrage
//!
//! A cycle task scans every pair on the configured exchange, analyzes the
//! candle history in parallel and opens trades through the application. A
//! monitor task closes trades when their stop or profit target is reached.

use crate::app::{AppError, TradingApplication};
use crate::config::TradingSettings;
use crate::config_manager::ConfigManager;
use crate::indicators::{self, BollingerBands};
use crate::types::{Candle, Order, Side};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const BB_STD: f64 = 2.0;
const VOLATILITY_WINDOW: usize = 14;
const CANDLE_INTERVAL: &str = "1m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    StrongUptrend,
    Uptrend,
    StrongDowntrend,
    Downtrend,
    Neutral,
}

impl Trend {
    /// Classify from the latest short, medium and long moving averages
    pub fn from_averages(short: Option<f64>, medium: Option<f64>, long: Option<f64>) -> Self {
        let (Some(short), Some(medium), Some(long)) = (short, medium, long) else {
            return Trend::Neutral;
        };
        if short > medium && medium > long {
            Trend::StrongUptrend
        } else if short > medium {
            Trend::Uptrend
        } else if short < medium && medium < long {
            Trend::StrongDowntrend
        } else if short < medium {
            Trend::Downtrend
        } else {
            Trend::Neutral
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Trend::StrongUptrend | Trend::Uptrend)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, Trend::StrongDowntrend | Trend::Downtrend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    StrongBuy,
    Buy,
    StrongSell,
    Sell,
    Neutral,
}

impl Momentum {
    pub fn from_indicators(rsi: Option<f64>, macd: Option<f64>, signal: Option<f64>) -> Self {
        let (Some(rsi), Some(macd), Some(signal)) = (rsi, macd, signal) else {
            return Momentum::Neutral;
        };
        if rsi < 30.0 && macd > signal {
            Momentum::StrongBuy
        } else if rsi < 40.0 && macd > signal {
            Momentum::Buy
        } else if rsi > 70.0 && macd < signal {
            Momentum::StrongSell
        } else if rsi > 60.0 && macd < signal {
            Momentum::Sell
        } else {
            Momentum::Neutral
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Momentum::StrongBuy | Momentum::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Momentum::StrongSell | Momentum::Sell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Smart,
    Arbitrage,
}

/// Trade opened by the auto trader and watched by the monitor
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTrade {
    pub symbol: String,
    pub kind: TradeKind,
    /// Other leg of an arbitrage trade
    pub paired_symbol: Option<String>,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub order_id: String,
    pub stop_price: f64,
    pub profit_target: f64,
}

impl ActiveTrade {
    pub fn stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Buy => price <= self.stop_price,
            Side::Sell => price >= self.stop_price,
        }
    }

    pub fn target_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Buy => price >= self.profit_target,
            Side::Sell => price <= self.profit_target,
        }
    }

    /// Profit as a fraction of entry, signed by direction
    pub fn profit_ratio(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * self.side.sign()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageOpportunity {
    pub pair1: String,
    pub pair2: String,
    pub price1: f64,
    pub price2: f64,
    pub difference: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoTraderStatus {
    pub is_running: bool,
    pub active_trades: usize,
    pub profit_target: f64,
    pub cycle_duration: u64,
}

/// Result of analyzing one pair that passed every entry condition
#[derive(Debug, Clone)]
struct Signal {
    symbol: String,
    trend: Trend,
    momentum: Momentum,
    volatility: f64,
    price: f64,
}

// ==========================================
// Analysis
// ==========================================

/// Mean high-low range of the last 13 candles over a 14 window, in price units
pub fn volatility(candles: &[Candle]) -> f64 {
    if candles.len() < VOLATILITY_WINDOW {
        return 0.0;
    }
    let ranges: f64 = candles[candles.len() - (VOLATILITY_WINDOW - 1)..]
        .iter()
        .map(|c| c.high - c.low)
        .sum();
    ranges / VOLATILITY_WINDOW as f64
}

/// Trend and momentum agree, volatility is tradeable and price sits near a band
fn trading_conditions(trend: Trend, momentum: Momentum, volatility: f64, bands: &BollingerBands) -> bool {
    let (Some(price), Some(upper), Some(lower)) = (
        indicators::last_value(&bands.middle),
        indicators::last_value(&bands.upper),
        indicators::last_value(&bands.lower),
    ) else {
        return false;
    };

    let aligned = (trend.is_up() && momentum.is_buy()) || (trend.is_down() && momentum.is_sell());
    let volatility_ok = volatility > 0.001 && volatility < 0.05;
    let at_extreme = price <= lower * 1.02 || price >= upper * 0.98;
    aligned && volatility_ok && at_extreme
}

/// Quote value committed to a smart trade
pub fn position_value(balance: f64, fraction: f64, volatility: f64) -> f64 {
    let base = balance * fraction;
    if volatility > 0.03 {
        base * 0.5
    } else if volatility < 0.01 {
        base * 1.5
    } else {
        base
    }
}

fn analyze(symbol: &str, candles: &[Candle], settings: &TradingSettings) -> Option<Signal> {
    let price = candles.last()?.close;
    let rsi = indicators::rsi(candles, RSI_PERIOD);
    let macd = indicators::macd(candles, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let bands = indicators::bollinger_bands(candles, BB_PERIOD, BB_STD);

    let trend = Trend::from_averages(
        indicators::last_value(&indicators::moving_average(candles, settings.trend_short)),
        indicators::last_value(&indicators::moving_average(candles, settings.trend_medium)),
        indicators::last_value(&indicators::moving_average(candles, settings.trend_long)),
    );
    let momentum = Momentum::from_indicators(
        indicators::last_value(&rsi),
        indicators::last_value(&macd.macd),
        indicators::last_value(&macd.signal),
    );
    let volatility = volatility(candles);

    debug!(
        "{}: trend {:?}, momentum {:?}, volatility {:.5}",
        symbol, trend, momentum, volatility
    );
    if !trading_conditions(trend, momentum, volatility, &bands) {
        return None;
    }
    Some(Signal {
        symbol: symbol.to_string(),
        trend,
        momentum,
        volatility,
        price,
    })
}

/// Every ordered pair whose relative price gap exceeds `min_difference`, widest first
pub fn find_arbitrage_opportunities(prices: &[(String, f64)], min_difference: f64) -> Vec<ArbitrageOpportunity> {
    let mut opportunities = Vec::new();
    for (symbol1, price1) in prices {
        for (symbol2, price2) in prices {
            if symbol1 == symbol2 || *price1 <= 0.0 || *price2 <= 0.0 {
                continue;
            }
            let difference = (price1 - price2).abs() / price1;
            if difference > min_difference {
                opportunities.push(ArbitrageOpportunity {
                    pair1: symbol1.clone(),
                    pair2: symbol2.clone(),
                    price1: *price1,
                    price2: *price2,
                    difference,
                });
            }
        }
    }
    opportunities.sort_by(|a, b| b.difference.total_cmp(&a.difference));
    opportunities
}

// ==========================================
// Auto trader
// ==========================================

pub struct AutoTrader {
    app: Arc<TradingApplication>,
    config: Arc<ConfigManager>,
    running: AtomicBool,
    active_trades: RwLock<HashMap<String, ActiveTrade>>,
    trading_lock: tokio::sync::Mutex<()>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutoTrader {
    pub fn new(app: Arc<TradingApplication>, config: Arc<ConfigManager>) -> Self {
        Self {
            app,
            config,
            running: AtomicBool::new(false),
            active_trades: RwLock::new(HashMap::new()),
            trading_lock: tokio::sync::Mutex::new(()),
            stop_tx: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the cycle and monitor tasks. Returns false if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Auto trader already running");
            return false;
        }

        self.stop_tx.send_replace(false);
        let cycle = tokio::spawn(Self::cycle_loop(Arc::downgrade(self), self.stop_tx.subscribe()));
        let monitor = tokio::spawn(Self::monitor_loop(Arc::downgrade(self), self.stop_tx.subscribe()));
        self.tasks.lock().extend([cycle, monitor]);
        info!("🤖 Auto trader started");
        true
    }

    /// Halt both tasks and close every open trade.
    ///
    /// A cycle in progress finishes first, so both arbitrage legs are
    /// always recorded before positions are closed.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Auto trader task failed: {}", e);
            }
        }
        self.close_all_positions().await;
        let remaining = self.active_count();
        if remaining > 0 {
            warn!("Auto trader stopped with {} trades still open", remaining);
        } else {
            info!("Auto trader stopped");
        }
    }

    pub fn active_trades(&self) -> HashMap<String, ActiveTrade> {
        self.active_trades.read().clone()
    }

    pub fn status(&self) -> AutoTraderStatus {
        let settings = self.config.settings();
        AutoTraderStatus {
            is_running: self.is_running(),
            active_trades: self.active_trades.read().len(),
            profit_target: settings.profit_target,
            cycle_duration: settings.cycle_duration_secs,
        }
    }

    fn active_count(&self) -> usize {
        self.active_trades.read().len()
    }

    fn is_active(&self, symbol: &str) -> bool {
        self.active_trades.read().contains_key(symbol)
    }

    fn trading_balance(&self) -> Result<f64, AppError> {
        Ok(self.app.wallet().trading_balance()?.to_f64().unwrap_or(0.0))
    }

    async fn cycle_loop(trader: Weak<Self>, mut stop_rx: watch::Receiver<bool>) {
        loop {
            let Some(this) = trader.upgrade() else {
                break;
            };
            if !this.is_running() {
                break;
            }
            let started = Instant::now();
            this.run_cycle().await;

            let cycle = Duration::from_secs(this.config.settings().cycle_duration_secs.max(1));
            drop(this);
            let remaining = cycle.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = stop_rx.changed() => break,
            }
        }
    }

    async fn monitor_loop(trader: Weak<Self>, mut stop_rx: watch::Receiver<bool>) {
        loop {
            let Some(this) = trader.upgrade() else {
                break;
            };
            if !this.is_running() {
                break;
            }
            this.check_positions().await;

            let interval = Duration::from_millis(this.config.settings().monitor_interval_ms.max(10));
            drop(this);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => break,
            }
        }
    }

    // ==========================================
    // Trading cycle
    // ==========================================

    /// Refresh the stored history from the exchange, then return it if long enough
    async fn load_candles(&self, symbol: &str, settings: &TradingSettings) -> Option<Vec<Candle>> {
        let market_data = self.app.market_data();

        match self
            .app
            .exchange()
            .candles(symbol, CANDLE_INTERVAL, settings.min_candles)
            .await
        {
            Ok(candles) => {
                let history = market_data.candle_history(symbol);
                match history.last() {
                    Some(newest) if history.len() >= settings.min_candles => {
                        let since = newest.timestamp;
                        for candle in candles.into_iter().filter(|c| c.timestamp >= since) {
                            market_data.push_candle(symbol, candle);
                        }
                    }
                    _ => market_data.record_candles(symbol, candles),
                }
            }
            Err(e) => warn!("Failed to refresh candles for {}: {}", symbol, e),
        }

        let history = market_data.candle_history(symbol);
        if history.len() < settings.min_candles {
            debug!("Not enough candles for {} ({})", symbol, history.len());
            return None;
        }
        Some(history)
    }

    async fn run_cycle(&self) {
        let settings = self.config.settings();
        let pairs = match self.app.exchange().available_pairs().await {
            Ok(pairs) => pairs,
            Err(e) => {
                error!("Trading cycle skipped, no pairs: {}", e);
                return;
            }
        };

        let mut series = Vec::new();
        for pair in &pairs {
            if self.is_active(&pair.symbol) {
                continue;
            }
            if let Some(candles) = self.load_candles(&pair.symbol, &settings).await {
                series.push((pair.symbol.clone(), candles));
            }
        }

        let analysis_settings = settings.clone();
        let signals = tokio::task::spawn_blocking(move || {
            series
                .par_iter()
                .filter_map(|(symbol, candles)| analyze(symbol, candles, &analysis_settings))
                .collect::<Vec<_>>()
        })
        .await;
        let signals = match signals {
            Ok(signals) => signals,
            Err(e) => {
                error!("Analysis task failed: {}", e);
                return;
            }
        };

        let _guard = self.trading_lock.lock().await;
        for signal in &signals {
            if self.active_count() >= settings.max_concurrent_trades {
                break;
            }
            if let Err(e) = self.execute_smart_trade(signal, &settings).await {
                error!("Smart trade on {} failed: {}", signal.symbol, e);
            }
        }

        if self.active_count() + 2 <= settings.max_concurrent_trades {
            let market_data = self.app.market_data();
            let prices: Vec<(String, f64)> = pairs
                .iter()
                .filter_map(|p| market_data.last_price(&p.symbol).map(|price| (p.symbol.clone(), price)))
                .collect();
            for opportunity in find_arbitrage_opportunities(&prices, settings.min_price_difference) {
                if self.active_count() + 2 > settings.max_concurrent_trades {
                    break;
                }
                if let Err(e) = self.execute_arbitrage_trade(&opportunity, &settings).await {
                    error!(
                        "Arbitrage {} / {} failed: {}",
                        opportunity.pair1, opportunity.pair2, e
                    );
                }
            }
        }
        debug!("Trading cycle done, {} active trades", self.active_count());
    }

    async fn execute_smart_trade(&self, signal: &Signal, settings: &TradingSettings) -> Result<(), AppError> {
        if self.is_active(&signal.symbol) || signal.price <= 0.0 {
            return Ok(());
        }

        let side = if signal.trend.is_up() { Side::Buy } else { Side::Sell };
        let value = position_value(self.trading_balance()?, settings.position_fraction, signal.volatility);
        let order = self
            .app
            .place_market_order(&signal.symbol, side, value / signal.price)
            .await?;

        let entry = order.fill_price.unwrap_or(signal.price);
        let (stop_price, profit_target) = match side {
            Side::Buy => (entry * (1.0 - settings.stop_loss), entry * settings.profit_target),
            Side::Sell => (entry * (1.0 + settings.stop_loss), entry / settings.profit_target),
        };
        info!(
            "Smart {} {} {:.6} @ {} ({:?}, {:?}), stop {:.4}, target {:.4}",
            side, signal.symbol, order.quantity, entry, signal.trend, signal.momentum, stop_price, profit_target
        );

        self.active_trades.write().insert(
            signal.symbol.clone(),
            ActiveTrade {
                symbol: signal.symbol.clone(),
                kind: TradeKind::Smart,
                paired_symbol: None,
                side,
                entry_price: entry,
                quantity: order.quantity,
                entry_time: Utc::now(),
                order_id: order.id,
                stop_price,
                profit_target,
            },
        );
        Ok(())
    }

    async fn execute_arbitrage_trade(
        &self,
        opportunity: &ArbitrageOpportunity,
        settings: &TradingSettings,
    ) -> Result<(), AppError> {
        if self.is_active(&opportunity.pair1) || self.is_active(&opportunity.pair2) {
            return Ok(());
        }

        let value = self.trading_balance()? * settings.arbitrage_fraction;
        let buy = self
            .app
            .place_market_order(&opportunity.pair1, Side::Buy, value / opportunity.price1)
            .await?;
        let sell = match self
            .app
            .place_market_order(&opportunity.pair2, Side::Sell, value / opportunity.price2)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                // Unwind the first leg
                self.app
                    .place_market_order(&opportunity.pair1, Side::Sell, buy.quantity)
                    .await?;
                return Err(e);
            }
        };

        let now = Utc::now();
        let leg = |symbol: &str, paired: &str, side: Side, order: Order, reference: f64| {
            let entry = order.fill_price.unwrap_or(reference);
            ActiveTrade {
                symbol: symbol.to_string(),
                kind: TradeKind::Arbitrage,
                paired_symbol: Some(paired.to_string()),
                side,
                entry_price: entry,
                quantity: order.quantity,
                entry_time: now,
                order_id: order.id,
                stop_price: entry * (1.0 - side.sign() * settings.stop_loss),
                profit_target: entry * (1.0 + side.sign() * opportunity.difference),
            }
        };
        let buy_leg = leg(&opportunity.pair1, &opportunity.pair2, Side::Buy, buy, opportunity.price1);
        let sell_leg = leg(&opportunity.pair2, &opportunity.pair1, Side::Sell, sell, opportunity.price2);

        info!(
            "Arbitrage buy {} / sell {} ({:.4}% gap)",
            opportunity.pair1,
            opportunity.pair2,
            opportunity.difference * 100.0
        );
        let mut trades = self.active_trades.write();
        trades.insert(buy_leg.symbol.clone(), buy_leg);
        trades.insert(sell_leg.symbol.clone(), sell_leg);
        Ok(())
    }

    // ==========================================
    // Position monitor
    // ==========================================

    async fn check_positions(&self) {
        let _guard = self.trading_lock.lock().await;
        let trades: Vec<ActiveTrade> = self.active_trades.read().values().cloned().collect();
        let market_data = self.app.market_data();

        for trade in trades {
            if !self.is_active(&trade.symbol) {
                // Closed as the paired leg of an earlier trade
                continue;
            }
            let Some(price) = market_data.last_price(&trade.symbol) else {
                continue;
            };
            let stop = trade.stop_hit(price);
            if stop || trade.target_hit(price) {
                info!(
                    "{} {} on {} @ {} ({:+.2}%)",
                    if stop { "Stop loss" } else { "Profit target" },
                    trade.side,
                    trade.symbol,
                    price,
                    trade.profit_ratio(price) * 100.0
                );
                self.close_position(&trade.symbol).await;
            }
        }
    }

    /// Close a trade and, for arbitrage, its paired leg
    async fn close_position(&self, symbol: &str) {
        let Some(trade) = self.active_trades.read().get(symbol).cloned() else {
            return;
        };
        if !self.close_trade(&trade).await {
            return;
        }

        if let Some(paired) = &trade.paired_symbol {
            let leg = self.active_trades.read().get(paired).cloned();
            if let Some(leg) = leg {
                self.close_trade(&leg).await;
            }
        }
    }

    /// A trade stays tracked until its closing order fills
    async fn close_trade(&self, trade: &ActiveTrade) -> bool {
        match self
            .app
            .place_market_order(&trade.symbol, trade.side.opposite(), trade.quantity)
            .await
        {
            Ok(_) => {
                self.active_trades.write().remove(&trade.symbol);
                true
            }
            Err(e) => {
                error!("Error closing {}: {}", trade.symbol, e);
                false
            }
        }
    }

    async fn close_all_positions(&self) {
        let _guard = self.trading_lock.lock().await;
        let symbols: Vec<String> = self.active_trades.read().keys().cloned().collect();
        for symbol in symbols {
            self.close_position(&symbol).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, MarketDataConfig};
    use crate::wallet::WalletKind;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn candle(minute: i64, close: f64, range: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            open: close,
            high: close + range / 2.0,
            low: close - range / 2.0,
            close,
            volume: 1.0,
        }
    }

    async fn trader(dir: &TempDir) -> Arc<AutoTrader> {
        let mut config = AppConfig::default();
        config.wallet.transaction_file = dir.path().join("tx.json").display().to_string();
        config.market_data = MarketDataConfig {
            base_url: "ws://127.0.0.1:1".to_string(),
            dev_url: String::new(),
            connection_timeout_secs: 1,
            ..MarketDataConfig::default()
        };
        let settings = config.trading.clone();
        let app = Arc::new(
            TradingApplication::new(config)
                .unwrap()
                .with_retry_unit(Duration::from_millis(1)),
        );
        app.initialize(2).await.unwrap();
        Arc::new(AutoTrader::new(app, Arc::new(ConfigManager::new(settings))))
    }

    fn signal(symbol: &str, trend: Trend, price: f64) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            trend,
            momentum: Momentum::Buy,
            volatility: 0.02,
            price,
        }
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(Trend::from_averages(Some(3.0), Some(2.0), Some(1.0)), Trend::StrongUptrend);
        assert_eq!(Trend::from_averages(Some(3.0), Some(2.0), Some(4.0)), Trend::Uptrend);
        assert_eq!(Trend::from_averages(Some(1.0), Some(2.0), Some(3.0)), Trend::StrongDowntrend);
        assert_eq!(Trend::from_averages(Some(1.0), Some(2.0), Some(0.5)), Trend::Downtrend);
        assert_eq!(Trend::from_averages(Some(2.0), Some(2.0), Some(2.0)), Trend::Neutral);
        assert_eq!(Trend::from_averages(Some(3.0), Some(2.0), None), Trend::Neutral);
    }

    #[test]
    fn test_momentum_thresholds() {
        assert_eq!(Momentum::from_indicators(Some(25.0), Some(1.0), Some(0.5)), Momentum::StrongBuy);
        assert_eq!(Momentum::from_indicators(Some(35.0), Some(1.0), Some(0.5)), Momentum::Buy);
        assert_eq!(Momentum::from_indicators(Some(75.0), Some(0.5), Some(1.0)), Momentum::StrongSell);
        assert_eq!(Momentum::from_indicators(Some(65.0), Some(0.5), Some(1.0)), Momentum::Sell);
        assert_eq!(Momentum::from_indicators(Some(25.0), Some(0.5), Some(1.0)), Momentum::Neutral);
        assert_eq!(Momentum::from_indicators(Some(50.0), Some(1.0), Some(0.5)), Momentum::Neutral);
        assert_eq!(Momentum::from_indicators(None, Some(1.0), Some(0.5)), Momentum::Neutral);
    }

    #[test]
    fn test_volatility_window() {
        let short: Vec<Candle> = (0..13).map(|i| candle(i, 10.0, 0.14)).collect();
        assert_eq!(volatility(&short), 0.0);

        // Oldest candle falls outside the 13 summed ranges
        let mut candles = vec![candle(0, 10.0, 5.0)];
        candles.extend((1..14).map(|i| candle(i, 10.0, 0.14)));
        assert!((volatility(&candles) - 0.13).abs() < 1e-9);
    }

    #[test]
    fn test_position_value_scales_with_volatility() {
        assert_eq!(position_value(10_000.0, 0.2, 0.02), 2_000.0);
        assert_eq!(position_value(10_000.0, 0.2, 0.04), 1_000.0);
        assert_eq!(position_value(10_000.0, 0.2, 0.005), 3_000.0);
    }

    #[test]
    fn test_trading_conditions() {
        let bands = BollingerBands {
            upper: vec![Some(110.0)],
            middle: vec![Some(100.0)],
            lower: vec![Some(99.0)],
        };
        assert!(trading_conditions(Trend::Uptrend, Momentum::Buy, 0.02, &bands));
        assert!(trading_conditions(Trend::StrongDowntrend, Momentum::StrongSell, 0.02, &bands));
        assert!(!trading_conditions(Trend::Uptrend, Momentum::Sell, 0.02, &bands));
        assert!(!trading_conditions(Trend::Uptrend, Momentum::Buy, 0.06, &bands));
        assert!(!trading_conditions(Trend::Uptrend, Momentum::Buy, 0.0005, &bands));

        let middle_of_band = BollingerBands {
            upper: vec![Some(120.0)],
            middle: vec![Some(100.0)],
            lower: vec![Some(80.0)],
        };
        assert!(!trading_conditions(Trend::Uptrend, Momentum::Buy, 0.02, &middle_of_band));
        assert!(!trading_conditions(Trend::Uptrend, Momentum::Buy, 0.02, &BollingerBands::default()));
    }

    #[test]
    fn test_analyze_flat_market_has_no_signal() {
        let candles: Vec<Candle> = (0..250).map(|i| candle(i, 100.0, 0.02)).collect();
        assert!(analyze("ETH/USDT", &candles, &TradingSettings::default()).is_none());
        assert!(analyze("ETH/USDT", &[], &TradingSettings::default()).is_none());
    }

    #[test]
    fn test_arbitrage_opportunities_sorted() {
        let prices = vec![
            ("A/USDT".to_string(), 100.0),
            ("B/USDT".to_string(), 100.1),
            ("C/USDT".to_string(), 101.0),
        ];
        let found = find_arbitrage_opportunities(&prices, 0.002);
        // A/B is within the minimum difference
        assert_eq!(found.len(), 4);
        assert!(found.windows(2).all(|w| w[0].difference >= w[1].difference));
        assert_eq!(found[0].pair1, "A/USDT");
        assert_eq!(found[0].pair2, "C/USDT");
        assert!((found[0].difference - 0.01).abs() < 1e-12);
        assert!(find_arbitrage_opportunities(&prices, 0.5).is_empty());
    }

    #[test]
    fn test_active_trade_exits() {
        let trade = ActiveTrade {
            symbol: "ETH/USDT".to_string(),
            kind: TradeKind::Smart,
            paired_symbol: None,
            side: Side::Sell,
            entry_price: 100.0,
            quantity: 1.0,
            entry_time: Utc::now(),
            order_id: "1".to_string(),
            stop_price: 105.0,
            profit_target: 50.0,
        };
        assert!(trade.stop_hit(105.0));
        assert!(!trade.stop_hit(104.0));
        assert!(trade.target_hit(49.0));
        assert!(!trade.target_hit(60.0));
        assert!((trade.profit_ratio(90.0) - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_smart_trade_and_profit_exit() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        let settings = TradingSettings::default();

        trader
            .execute_smart_trade(&signal("ETH/USDT", Trend::Uptrend, 1950.0), &settings)
            .await
            .unwrap();
        let trade = trader.active_trades()["ETH/USDT"].clone();
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.entry_price, 1950.0);
        assert!((trade.stop_price - 1852.5).abs() < 1e-9);
        assert_eq!(trade.profit_target, 3900.0);
        // 20% of 10,000 at 1950
        assert!((trade.quantity - 2000.0 / 1950.0).abs() < 1e-9);

        trader.app.update_market_data("ETH/USDT", 3900.0);
        trader.check_positions().await;
        assert!(trader.active_trades().is_empty());
        assert!(trader.app.position("ETH/USDT").is_none());
    }

    #[tokio::test]
    async fn test_sell_trade_targets() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        trader
            .execute_smart_trade(&signal("BTC/USDT", Trend::Downtrend, 30000.0), &TradingSettings::default())
            .await
            .unwrap();
        let trade = trader.active_trades()["BTC/USDT"].clone();
        assert_eq!(trade.side, Side::Sell);
        assert!((trade.stop_price - 31500.0).abs() < 1e-9);
        assert_eq!(trade.profit_target, 15000.0);

        // Between stop and target, nothing happens
        trader.app.update_market_data("BTC/USDT", 30100.0);
        trader.check_positions().await;
        assert_eq!(trader.status().active_trades, 1);
    }

    #[tokio::test]
    async fn test_arbitrage_legs_close_together() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        let opportunity = ArbitrageOpportunity {
            pair1: "ETH/USDT".to_string(),
            pair2: "LINK/USDT".to_string(),
            price1: 1950.0,
            price2: 15.0,
            difference: 0.01,
        };
        trader
            .execute_arbitrage_trade(&opportunity, &TradingSettings::default())
            .await
            .unwrap();

        let trades = trader.active_trades();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades["ETH/USDT"].paired_symbol.as_deref(), Some("LINK/USDT"));
        assert_eq!(trades["LINK/USDT"].side, Side::Sell);
        assert!((trades["ETH/USDT"].profit_target - 1969.5).abs() < 1e-9);

        // Stop on the buy leg closes the sell leg as well
        trader.app.update_market_data("ETH/USDT", 1800.0);
        trader.check_positions().await;
        assert!(trader.active_trades().is_empty());
        assert!(trader.app.all_positions().is_empty());
    }

    #[tokio::test]
    async fn test_load_candles_refreshes_stored_history() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        let settings = TradingSettings::default();

        let stale: Vec<Candle> = (0..250).map(|i| candle(i, 1900.0, 1.0)).collect();
        let stale_newest = stale[249].timestamp;
        trader.app.market_data().record_candles("ETH/USDT", stale);

        let first = trader.load_candles("ETH/USDT", &settings).await.unwrap();
        let first_newest = first.last().unwrap().timestamp;
        assert!(first_newest > stale_newest);
        assert!(Utc::now() - first_newest < chrono::Duration::minutes(1));
        // Older history is kept ahead of the fetched candles
        assert_eq!(first[0].timestamp, Utc.timestamp_opt(0, 0).unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = trader.load_candles("ETH/USDT", &settings).await.unwrap();
        assert!(second.last().unwrap().timestamp > first_newest);
        assert_eq!(
            trader.app.market_data().last_price("ETH/USDT"),
            Some(second.last().unwrap().close)
        );
    }

    #[tokio::test]
    async fn test_failed_close_keeps_trade() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        trader
            .execute_smart_trade(&signal("ETH/USDT", Trend::Uptrend, 1950.0), &TradingSettings::default())
            .await
            .unwrap();

        // Empty trading wallet: the closing order is rejected
        let balance = trader.app.wallet().trading_balance().unwrap();
        trader
            .app
            .transfer_between_wallets(WalletKind::Trading, WalletKind::Profit, balance)
            .unwrap();
        trader.app.update_market_data("ETH/USDT", 3900.0);
        trader.check_positions().await;
        assert!(trader.active_trades().contains_key("ETH/USDT"));

        trader
            .app
            .transfer_between_wallets(WalletKind::Profit, WalletKind::Trading, balance)
            .unwrap();
        trader.check_positions().await;
        assert!(trader.active_trades().is_empty());
    }

    #[tokio::test]
    async fn test_stop_waits_for_loops() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        assert!(trader.start());
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(10), trader.stop())
            .await
            .unwrap();
        assert!(trader.tasks.lock().is_empty());
        assert!(!trader.is_running());

        // Restart after a clean stop
        assert!(trader.start());
        trader.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = TempDir::new().unwrap();
        let trader = trader(&dir).await;
        assert!(!trader.status().is_running);

        assert!(trader.start());
        assert!(!trader.start());
        assert!(trader.status().is_running);
        assert_eq!(trader.status().profit_target, 2.0);
        assert_eq!(trader.status().cycle_duration, 300);

        trader.stop().await;
        assert!(!trader.is_running());
        assert!(trader.active_trades().is_empty());
    }
}
