//! Trading Engine - simulated execution with position tracking
//!
//! Orders are validated against the wallet's trading balance and filled
//! locally. Conditional orders rest until a price update crosses their
//! trigger. Position changes are published to subscribers over channels.

use crate::types::{InitState, Order, OrderStatus, OrderType, Position, Side};
use crate::wallet::WalletModule;

use async_trait::async_trait;
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_RISK_PERCENTAGE: f64 = 0.02;
const SIZE_EPSILON: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not initialized")]
    NotInitialized,
    #[error("Insufficient balance: required {required:.2}, available {available:.2}")]
    InsufficientBalance { required: f64, available: f64 },
    #[error("Quantity must be positive")]
    InvalidQuantity,
    #[error("{0} order requires a price")]
    MissingPrice(OrderType),
    #[error("{0} order requires a trigger price")]
    MissingTrigger(OrderType),
    #[error("No market price available for {0}")]
    NoMarketPrice(String),
    #[error("Wallet error: {0}")]
    Wallet(String),
    #[error("Component {0} not ready before timeout")]
    Timeout(String),
    #[error("Health check failed: {0}")]
    HealthCheck(String),
    #[error("Position sync failed: {0}")]
    Sync(String),
}

/// Incoming order parameters
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            trigger_price: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            order_type: OrderType::Limit,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn conditional(symbol: &str, side: Side, quantity: f64, order_type: OrderType, trigger_price: f64) -> Self {
        Self {
            order_type,
            trigger_price: Some(trigger_price),
            ..Self::market(symbol, side, quantity)
        }
    }
}

/// Published on every position change
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Updated(Position),
    Closed { position: Position, realized_pnl: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PnlSummary {
    pub unrealized: f64,
    pub realized: f64,
    pub total: f64,
}

/// Readiness and position sources the engine checks during initialization
#[async_trait]
pub trait EngineComponents: Send + Sync {
    /// Names of components and whether each is initialized
    fn component_status(&self) -> Vec<(&'static str, bool)>;
    async fn verify_health(&self) -> Result<(), String>;
    async fn fetch_positions(&self) -> Result<Vec<Position>, String>;
    fn market_data_active(&self) -> bool;
}

pub struct TradingEngine {
    wallet: std::sync::Arc<WalletModule>,
    positions: RwLock<HashMap<String, Position>>,
    orders: RwLock<Vec<Order>>,
    next_order_id: AtomicU64,
    risk_percentage: RwLock<f64>,
    realized_total: RwLock<f64>,
    subscribers: RwLock<Vec<Sender<PositionEvent>>>,
    init_state: RwLock<InitState>,
    initialized: AtomicBool,
    retry_base: Duration,
    component_timeout: Duration,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl TradingEngine {
    pub fn new(wallet: std::sync::Arc<WalletModule>) -> Self {
        Self {
            wallet,
            positions: RwLock::new(HashMap::new()),
            orders: RwLock::new(Vec::new()),
            next_order_id: AtomicU64::new(1),
            risk_percentage: RwLock::new(DEFAULT_RISK_PERCENTAGE),
            realized_total: RwLock::new(0.0),
            subscribers: RwLock::new(Vec::new()),
            init_state: RwLock::new(InitState::NotStarted),
            initialized: AtomicBool::new(false),
            retry_base: Duration::from_secs(1),
            component_timeout: Duration::from_secs(30),
        }
    }

    /// Override initialization timings (backoff base and per-component wait)
    pub fn with_timings(mut self, retry_base: Duration, component_timeout: Duration) -> Self {
        self.retry_base = retry_base;
        self.component_timeout = component_timeout;
        self
    }

    // ==========================================
    // Initialization
    // ==========================================

    pub async fn initialize<C: EngineComponents + ?Sized>(
        &self,
        components: &C,
        max_retries: u32,
    ) -> Result<(), EngineError> {
        *self.init_state.write() = InitState::Starting;
        let mut last_error = EngineError::NotInitialized;

        for attempt in 0..max_retries.max(1) {
            info!("Initializing trading engine (attempt {}/{})", attempt + 1, max_retries.max(1));
            self.positions.write().clear();
            self.orders.write().clear();

            match self.try_initialize(components).await {
                Ok(()) => {
                    *self.init_state.write() = InitState::Completed;
                    self.initialized.store(true, Ordering::SeqCst);
                    info!("✅ Trading engine initialized");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Trading engine initialization attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(self.retry_base * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        *self.init_state.write() = InitState::Failed;
        error!("Trading engine initialization failed: {}", last_error);
        Err(last_error)
    }

    async fn try_initialize<C: EngineComponents + ?Sized>(&self, components: &C) -> Result<(), EngineError> {
        *self.init_state.write() = InitState::CheckingComponents;
        let started = Instant::now();
        loop {
            let pending: Vec<&str> = components
                .component_status()
                .into_iter()
                .filter(|(_, ready)| !ready)
                .map(|(name, _)| name)
                .collect();
            if pending.is_empty() {
                break;
            }
            if started.elapsed() > self.component_timeout {
                return Err(EngineError::Timeout(pending.join(", ")));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.init_state.write() = InitState::VerifyingHealth;
        components.verify_health().await.map_err(EngineError::HealthCheck)?;

        *self.init_state.write() = InitState::SyncingPositions;
        let synced = components.fetch_positions().await.map_err(EngineError::Sync)?;
        if !synced.is_empty() {
            info!("Synced {} positions from exchange", synced.len());
        }
        let mut positions = self.positions.write();
        for position in synced {
            positions.insert(position.symbol.clone(), position);
        }
        drop(positions);

        *self.init_state.write() = InitState::VerifyingMarketData;
        if !components.market_data_active() {
            warn!("Market data stream not active yet, continuing with simulated prices");
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn init_state(&self) -> InitState {
        *self.init_state.read()
    }

    // ==========================================
    // Risk
    // ==========================================

    pub fn risk_percentage(&self) -> f64 {
        *self.risk_percentage.read()
    }

    pub fn set_risk_percentage(&self, risk: f64) {
        *self.risk_percentage.write() = risk.max(0.0);
        debug!("Risk percentage set to {:.4}", risk);
    }

    /// Size such that hitting the stop loses `risk_percentage` of the trading balance
    pub fn calculate_position_size(&self, entry_price: f64, stop_loss: f64) -> Result<f64, EngineError> {
        let balance = to_f64(
            self.wallet
                .trading_balance()
                .map_err(|e| EngineError::Wallet(e.to_string()))?,
        );
        let price_risk = (entry_price - stop_loss).abs();
        if price_risk == 0.0 {
            return Ok(0.0);
        }
        Ok(balance * self.risk_percentage() / price_risk)
    }

    // ==========================================
    // Orders
    // ==========================================

    /// Validate and execute an order. `market_price` is the last known price
    /// for the symbol and is required for market orders.
    pub fn place_order(&self, request: OrderRequest, market_price: Option<f64>) -> Result<Order, EngineError> {
        if !(request.quantity > 0.0) {
            return Err(EngineError::InvalidQuantity);
        }

        let fill_price = match request.order_type {
            OrderType::Market => {
                Some(market_price.ok_or_else(|| EngineError::NoMarketPrice(request.symbol.clone()))?)
            }
            OrderType::Limit => Some(request.price.ok_or(EngineError::MissingPrice(OrderType::Limit))?),
            OrderType::StopLoss | OrderType::TakeProfit => {
                if request.trigger_price.is_none() {
                    return Err(EngineError::MissingTrigger(request.order_type));
                }
                None
            }
        };

        let reference_price = request.price.or(fill_price).or(request.trigger_price).unwrap_or(0.0);
        let required = request.quantity * reference_price;
        let available = to_f64(
            self.wallet
                .trading_balance()
                .map_err(|e| EngineError::Wallet(e.to_string()))?,
        );
        let required_dec = Decimal::from_f64(required).unwrap_or(Decimal::MAX);
        if !self.wallet.has_sufficient_trading_balance(required_dec) {
            warn!("Rejected {} {} {}: insufficient balance", request.side, request.quantity, request.symbol);
            return Err(EngineError::InsufficientBalance { required, available });
        }

        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut order = Order {
            id,
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            trigger_price: request.trigger_price,
            fill_price: None,
            status: OrderStatus::Pending,
            timestamp: Utc::now(),
        };

        if let Some(price) = fill_price {
            order.status = OrderStatus::Filled;
            order.fill_price = Some(price);
            self.apply_fill(&order.symbol, order.side, order.quantity, price);
            info!(
                "Filled order {}: {} {} {} @ {}",
                order.id, order.side, order.quantity, order.symbol, price
            );
        } else {
            info!(
                "Placed {} order {}: {} {} {} trigger {:?}",
                order.order_type, order.id, order.side, order.quantity, order.symbol, order.trigger_price
            );
        }

        self.orders.write().push(order.clone());
        Ok(order)
    }

    /// Cancel a pending order. Returns false if it is unknown or already final.
    pub fn cancel_order(&self, order_id: &str) -> bool {
        let mut orders = self.orders.write();
        match orders.iter_mut().find(|o| o.id == order_id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Cancelled;
                info!("Cancelled order {}", order_id);
                true
            }
            _ => false,
        }
    }

    /// Order history, optionally for one symbol
    pub fn order_history(&self, symbol: Option<&str>) -> Vec<Order> {
        self.orders
            .read()
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect()
    }

    /// Apply an order update reported by an exchange
    pub fn apply_exchange_fill(&self, order: &Order) {
        if order.status != OrderStatus::Filled {
            return;
        }
        if let Some(price) = order.fill_price.or(order.price) {
            self.apply_fill(&order.symbol, order.side, order.quantity, price);
        }
    }

    // ==========================================
    // Positions
    // ==========================================

    fn apply_fill(&self, symbol: &str, side: Side, quantity: f64, price: f64) {
        let signed = quantity * side.sign();
        let event = {
            let mut positions = self.positions.write();
            match positions.get_mut(symbol) {
                None => {
                    let position = Position::new(symbol, signed, price);
                    positions.insert(symbol.to_string(), position.clone());
                    PositionEvent::Updated(position)
                }
                Some(position) => {
                    let new_size = position.size + signed;
                    if new_size.abs() < SIZE_EPSILON {
                        let realized = (price - position.entry_price) * position.size;
                        position.realized_pnl += realized;
                        position.current_price = price;
                        position.size = 0.0;
                        position.unrealized_pnl = 0.0;
                        position.timestamp = Utc::now();
                        let closed = position.clone();
                        positions.remove(symbol);
                        *self.realized_total.write() += realized;
                        info!("Closed {} position, realized PnL {:.4}", symbol, realized);
                        PositionEvent::Closed {
                            position: closed,
                            realized_pnl: realized,
                        }
                    } else {
                        position.size = new_size;
                        position.entry_price = price;
                        position.current_price = price;
                        position.unrealized_pnl = 0.0;
                        position.timestamp = Utc::now();
                        PositionEvent::Updated(position.clone())
                    }
                }
            }
        };
        self.notify(event);
    }

    /// Mark positions to market and fire conditional orders whose trigger is crossed.
    /// Returns the orders filled by this update.
    pub fn update_positions(&self, prices: &HashMap<String, f64>) -> Vec<Order> {
        let mut updated = Vec::new();
        {
            let mut positions = self.positions.write();
            for (symbol, &price) in prices {
                if let Some(position) = positions.get_mut(symbol) {
                    position.current_price = price;
                    position.unrealized_pnl = (price - position.entry_price) * position.size;
                    position.timestamp = Utc::now();
                    updated.push(position.clone());
                }
            }
        }
        for position in updated {
            self.notify(PositionEvent::Updated(position));
        }

        let mut triggered = Vec::new();
        {
            let mut orders = self.orders.write();
            for order in orders.iter_mut().filter(|o| o.status == OrderStatus::Pending) {
                let (Some(&price), Some(trigger)) = (prices.get(&order.symbol), order.trigger_price) else {
                    continue;
                };
                if Self::is_triggered(order.order_type, order.side, price, trigger) {
                    order.status = OrderStatus::Filled;
                    order.fill_price = Some(price);
                    triggered.push(order.clone());
                }
            }
        }
        for order in &triggered {
            info!(
                "Triggered {} order {}: {} {} {} @ {}",
                order.order_type, order.id, order.side, order.quantity, order.symbol,
                order.fill_price.unwrap_or_default()
            );
            self.apply_fill(&order.symbol, order.side, order.quantity, order.fill_price.unwrap_or_default());
        }
        triggered
    }

    fn is_triggered(order_type: OrderType, side: Side, price: f64, trigger: f64) -> bool {
        match (order_type, side) {
            (OrderType::StopLoss, Side::Sell) => price <= trigger,
            (OrderType::StopLoss, Side::Buy) => price >= trigger,
            (OrderType::TakeProfit, Side::Sell) => price >= trigger,
            (OrderType::TakeProfit, Side::Buy) => price <= trigger,
            _ => false,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        let mut list: Vec<Position> = self.positions.read().values().cloned().collect();
        list.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        list
    }

    pub fn total_pnl(&self) -> PnlSummary {
        let positions = self.positions.read();
        let unrealized: f64 = positions.values().map(|p| p.unrealized_pnl).sum();
        let open_realized: f64 = positions.values().map(|p| p.realized_pnl).sum();
        let realized = *self.realized_total.read() + open_realized;
        PnlSummary {
            unrealized,
            realized,
            total: unrealized + realized,
        }
    }

    // ==========================================
    // Subscribers
    // ==========================================

    /// Subscribe to position changes
    pub fn subscribe(&self) -> Receiver<PositionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    fn notify(&self, event: PositionEvent) {
        // Drop subscribers whose receiver is gone
        self.subscribers.write().retain(|tx| tx.send(event.clone()).is_ok());
    }
}
