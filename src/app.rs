//! Trading application - wires wallet, exchange, market data and engine
//!
//! Initialization order is wallet, exchange, market data, engine. Exchange
//! events and engine position events are consumed by background tasks that
//! keep positions marked to market and credit realized PnL to the wallet.

use crate::config::AppConfig;
use crate::exchange::{create_exchange, ExchangeError, ExchangeEvent, ExchangeService, ExchangeStatus};
use crate::market_data::{MarketDataError, MarketDataService};
use crate::trading::{EngineComponents, EngineError, OrderRequest, PnlSummary, PositionEvent, TradingEngine};
use crate::types::{InitState, Order, OrderType, Position, Side};
use crate::wallet::{Transaction, WalletBalances, WalletError, WalletKind, WalletModule};

use async_trait::async_trait;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_RISK: f64 = 0.02;
const RISK_BALANCE_SCALE: f64 = 5000.0;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Trading application not initialized")]
    NotInitialized,
    #[error("Invalid conditional order type: {0}")]
    InvalidOrderType(OrderType),
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
}

/// Risk per trade for a trading balance: `min(0.02, 5000 / balance)`, 0 when empty
pub fn risk_for_balance(balance: Decimal) -> f64 {
    let balance = balance.to_f64().unwrap_or(0.0);
    if balance <= 0.0 {
        return 0.0;
    }
    MAX_RISK.min(RISK_BALANCE_SCALE / balance)
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub initialized: bool,
    pub init_state: InitState,
    pub engine_state: InitState,
    pub exchange: ExchangeStatus,
    pub market_data_connections: HashMap<String, bool>,
    pub stream_active: bool,
}

pub struct TradingApplication {
    config: AppConfig,
    wallet: Arc<WalletModule>,
    engine: Arc<TradingEngine>,
    exchange: Arc<dyn ExchangeService>,
    market_data: Arc<MarketDataService>,
    initialized: AtomicBool,
    init_state: RwLock<InitState>,
    events_wired: AtomicBool,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    retry_unit: Duration,
}

impl TradingApplication {
    /// Build the application with the configured default exchange
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let exchange = create_exchange(&config)?;
        Ok(Self::with_exchange(config, exchange))
    }

    pub fn with_exchange(config: AppConfig, exchange: Arc<dyn ExchangeService>) -> Self {
        let wallet = Arc::new(WalletModule::new(&config.wallet.transaction_file));
        let engine = Arc::new(TradingEngine::new(Arc::clone(&wallet)));
        let market_data = Arc::new(MarketDataService::new(&config.market_data));
        Self {
            config,
            wallet,
            engine,
            exchange,
            market_data,
            initialized: AtomicBool::new(false),
            init_state: RwLock::new(InitState::NotStarted),
            events_wired: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            retry_unit: Duration::from_secs(1),
        }
    }

    /// Scale every retry delay (tests use milliseconds)
    pub fn with_retry_unit(mut self, unit: Duration) -> Self {
        self.retry_unit = unit;
        let wallet = Arc::clone(&self.wallet);
        self.engine = Arc::new(TradingEngine::new(wallet).with_timings(unit, unit * 30));
        self.market_data = Arc::new(MarketDataService::new(&self.config.market_data).with_retry_base(unit));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn wallet(&self) -> &Arc<WalletModule> {
        &self.wallet
    }

    pub fn engine(&self) -> &Arc<TradingEngine> {
        &self.engine
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeService> {
        &self.exchange
    }

    pub fn market_data(&self) -> &Arc<MarketDataService> {
        &self.market_data
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn init_state(&self) -> InitState {
        *self.init_state.read()
    }

    // ==========================================
    // Initialization
    // ==========================================

    pub async fn initialize(self: &Arc<Self>, max_retries: u32) -> Result<(), AppError> {
        if self.is_initialized() {
            return Ok(());
        }
        *self.init_state.write() = InitState::Starting;
        let attempts = max_retries.max(1);
        let mut last_error = AppError::NotInitialized;

        for attempt in 0..attempts {
            info!("Initializing trading application (attempt {}/{})", attempt + 1, attempts);
            match self.try_initialize(max_retries).await {
                Ok(()) => {
                    self.initialized.store(true, Ordering::SeqCst);
                    *self.init_state.write() = InitState::Completed;
                    info!("✅ Trading application initialized");
                    return Ok(());
                }
                Err(AppError::Wallet(e)) => {
                    *self.init_state.write() = InitState::Failed;
                    error!("Wallet initialization failed: {}", e);
                    return Err(AppError::Wallet(e));
                }
                Err(e) => {
                    warn!("Initialization attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry_unit * (2 * (attempt + 1))).await;
                    }
                }
            }
        }

        *self.init_state.write() = InitState::Failed;
        Err(AppError::InitializationFailed(last_error.to_string()))
    }

    async fn try_initialize(self: &Arc<Self>, max_retries: u32) -> Result<(), AppError> {
        *self.init_state.write() = InitState::CheckingComponents;

        let wallet = Arc::clone(&self.wallet);
        self.retry_component("wallet", max_retries, || {
            let wallet = Arc::clone(&wallet);
            async move { wallet.initialize() }
        })
        .await?;

        let exchange = Arc::clone(&self.exchange);
        self.retry_component("exchange", max_retries, || {
            let exchange = Arc::clone(&exchange);
            async move { exchange.connect(1).await }
        })
        .await?;

        if let Err(e) = self.start_market_data(max_retries).await {
            warn!("Market data unavailable, continuing with exchange prices: {}", e);
        }

        self.wire_events();

        *self.init_state.write() = InitState::VerifyingHealth;
        self.engine.initialize(self.as_ref(), max_retries).await?;
        Ok(())
    }

    async fn start_market_data(&self, max_retries: u32) -> Result<(), MarketDataError> {
        self.market_data.initialize(max_retries).await?;
        self.market_data.connect().await
    }

    /// Retry one component with delay `min(2^(n-1), 10)` units
    async fn retry_component<T, E, F, Fut>(&self, name: &str, max_retries: u32, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = max_retries.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match op().await {
                Ok(value) => {
                    debug!("{} ready after {} attempt(s)", name, tries);
                    return Ok(value);
                }
                Err(e) if tries >= attempts => {
                    error!("{} failed after {} attempts: {}", name, tries, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry_unit * 2u32.pow(tries - 1).min(10);
                    warn!("{} attempt {} failed: {}, retrying in {:?}", name, tries, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn wire_events(self: &Arc<Self>) {
        if self.events_wired.swap(true, Ordering::SeqCst) {
            return;
        }

        // Balance changes drive the risk percentage
        let engine: Weak<TradingEngine> = Arc::downgrade(&self.engine);
        self.wallet.on_balance_update(Box::new(move |balance| {
            if let Some(engine) = engine.upgrade() {
                engine.set_risk_percentage(risk_for_balance(balance));
            }
        }));
        if let Ok(balance) = self.wallet.trading_balance() {
            self.engine.set_risk_percentage(risk_for_balance(balance));
        }

        // Realized PnL is credited to the trading wallet
        let positions = self.engine.subscribe();
        let wallet = Arc::clone(&self.wallet);
        let shutdown = Arc::clone(&self.shutdown);
        let position_task = tokio::task::spawn_blocking(move || loop {
            match positions.recv_timeout(Duration::from_millis(500)) {
                Ok(PositionEvent::Closed { position, realized_pnl }) => {
                    let delta = Decimal::from_f64(realized_pnl).unwrap_or_default();
                    match wallet.update_trading_balance(delta) {
                        Ok(balance) => info!(
                            "Credited {:.4} realized PnL from {} (balance {})",
                            realized_pnl, position.symbol, balance
                        ),
                        Err(e) => error!("Failed to credit realized PnL: {}", e),
                    }
                }
                Ok(PositionEvent::Updated(_)) => {}
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        // Exchange prices and fills feed the engine
        let mut events = self.exchange.subscribe_events();
        let app = Arc::downgrade(self);
        let exchange_task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Dropped {} exchange events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(app) = app.upgrade() else {
                    break;
                };
                app.handle_exchange_event(event);
            }
        });

        self.tasks.lock().extend([position_task, exchange_task]);
    }

    fn handle_exchange_event(&self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::PriceUpdated { symbol, price, .. } => self.update_market_data(&symbol, price),
            ExchangeEvent::OrderUpdated(order) => self.engine.apply_exchange_fill(&order),
            ExchangeEvent::Error { exchange, message } => warn!("{} reported: {}", exchange, message),
            ExchangeEvent::OrderBookUpdated { .. } => {}
        }
    }

    // ==========================================
    // Orders
    // ==========================================

    fn ensure_initialized(&self) -> Result<(), AppError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(AppError::NotInitialized)
        }
    }

    /// Last known price, falling back to the exchange book mid
    pub async fn market_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.market_data.last_price(symbol) {
            return Some(price);
        }
        match self.exchange.order_book(symbol).await {
            Ok(Some(book)) if book.mid_price() > 0.0 => Some(book.mid_price()),
            Ok(_) => None,
            Err(e) => {
                debug!("No book price for {}: {}", symbol, e);
                None
            }
        }
    }

    pub async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> Result<Order, AppError> {
        self.ensure_initialized()?;
        let price = self.market_price(symbol).await;
        Ok(self.engine.place_order(OrderRequest::market(symbol, side, quantity), price)?)
    }

    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Order, AppError> {
        self.ensure_initialized()?;
        let market = self.market_price(symbol).await;
        Ok(self
            .engine
            .place_order(OrderRequest::limit(symbol, side, quantity, price), market)?)
    }

    pub async fn place_conditional_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
        trigger_price: f64,
    ) -> Result<Order, AppError> {
        self.ensure_initialized()?;
        if !order_type.is_conditional() {
            return Err(AppError::InvalidOrderType(order_type));
        }
        let market = self.market_price(symbol).await;
        Ok(self.engine.place_order(
            OrderRequest::conditional(symbol, side, quantity, order_type, trigger_price),
            market,
        )?)
    }

    pub fn cancel_order(&self, order_id: &str) -> bool {
        self.engine.cancel_order(order_id)
    }

    pub fn order_history(&self, symbol: Option<&str>) -> Vec<Order> {
        self.engine.order_history(symbol)
    }

    // ==========================================
    // Wallet and positions
    // ==========================================

    pub fn wallet_balances(&self) -> WalletBalances {
        self.wallet.balances()
    }

    pub fn transfer_between_wallets(
        &self,
        from: WalletKind,
        to: WalletKind,
        amount: Decimal,
    ) -> Result<Transaction, AppError> {
        Ok(self.wallet.transfer(from, to, amount)?)
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.engine.position(symbol)
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.engine.all_positions()
    }

    pub fn calculate_total_pnl(&self) -> PnlSummary {
        self.engine.total_pnl()
    }

    /// Record a price and mark positions to it
    pub fn update_market_data(&self, symbol: &str, price: f64) {
        self.market_data.update_price(symbol, price);
        let prices = HashMap::from([(symbol.to_string(), price)]);
        let triggered = self.engine.update_positions(&prices);
        if !triggered.is_empty() {
            info!("{} conditional order(s) triggered on {} @ {}", triggered.len(), symbol, price);
        }
    }

    pub fn status(&self) -> AppStatus {
        AppStatus {
            initialized: self.is_initialized(),
            init_state: self.init_state(),
            engine_state: self.engine.init_state(),
            exchange: self.exchange.status(),
            market_data_connections: self.market_data.connection_statuses(),
            stream_active: self.market_data.verify_stream_active(),
        }
    }

    /// Stop background tasks and close connections
    pub async fn cleanup(&self) {
        info!("Cleaning up trading application");
        self.shutdown.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.market_data.disconnect_all();
        self.exchange.disconnect().await;
        self.initialized.store(false, Ordering::SeqCst);
        info!("Cleanup complete");
    }
}

#[async_trait]
impl EngineComponents for TradingApplication {
    fn component_status(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("wallet", self.wallet.is_initialized()),
            ("exchange", self.exchange.is_connected()),
        ]
    }

    async fn verify_health(&self) -> Result<(), String> {
        if !self.wallet.verify_health() {
            return Err("wallet health check failed".to_string());
        }
        if !self.exchange.is_connected() {
            return Err(format!("{} is not connected", self.exchange.name()));
        }
        Ok(())
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, String> {
        self.exchange.positions().await.map_err(|e| e.to_string())
    }

    fn market_data_active(&self) -> bool {
        self.market_data.verify_stream_active()
    }
}
