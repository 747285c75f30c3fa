//! API request handlers
//!
//! All endpoint handlers for the trading API.

use crate::app::AppError;
use crate::config_manager::SettingsUpdate;
use crate::market_data::MAX_CANDLE_HISTORY;
use crate::trading::EngineError;
use crate::types::{OrderType, Side};
use crate::wallet::{WalletError, WalletKind};
use crate::AppState;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

// ==========================================
// Response Helpers
// ==========================================

pub fn error_response(error: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

pub fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

fn not_found(error: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

/// Validation failures are the caller's fault, everything else is ours
fn app_error(e: AppError) -> Response {
    let client_error = match &e {
        AppError::NotInitialized | AppError::InvalidOrderType(_) => true,
        AppError::Engine(engine) => matches!(
            engine,
            EngineError::NotInitialized
                | EngineError::InsufficientBalance { .. }
                | EngineError::InvalidQuantity
                | EngineError::MissingPrice(_)
                | EngineError::MissingTrigger(_)
                | EngineError::NoMarketPrice(_)
        ),
        AppError::Wallet(wallet) => is_wallet_client_error(wallet),
        _ => false,
    };
    if client_error {
        bad_request(&e.to_string())
    } else {
        error!("Request failed: {}", e);
        error_response(&e.to_string())
    }
}

fn is_wallet_client_error(e: &WalletError) -> bool {
    matches!(
        e,
        WalletError::NotInitialized
            | WalletError::InvalidAmount(_)
            | WalletError::InsufficientFunds { .. }
            | WalletError::UnknownWallet(_)
            | WalletError::SameWallet(_)
    )
}

fn wallet_error(e: WalletError) -> Response {
    if is_wallet_client_error(&e) {
        bad_request(&e.to_string())
    } else {
        error_response(&e.to_string())
    }
}

/// Malformed bodies get the same JSON error shape as every other failure
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| bad_request(&rejection.body_text()))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, Response> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| bad_request(&rejection.body_text()))
}

/// Path symbols use a dash ("ETH-USDT") since "/" cannot appear in a segment
fn path_symbol(raw: &str) -> Result<String, Response> {
    let symbol = raw.replace('-', "/").to_uppercase();
    if symbol.split('/').filter(|part| !part.is_empty()).count() != 2 {
        return Err(bad_request(&format!("Invalid trading pair: {}", raw)));
    }
    Ok(symbol)
}

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub to: String,
    pub amount: Decimal,
    #[serde(default = "default_external_address")]
    pub from_address: String,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub from: String,
    pub amount: Decimal,
    #[serde(default = "default_external_address")]
    pub to_address: String,
}

fn default_external_address() -> String {
    "external".to_string()
}

#[derive(Debug, Deserialize)]
pub struct OrderRequestBody {
    pub symbol: String,
    pub side: String,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
}

fn default_order_type() -> String {
    "market".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolQuery {
    pub symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CandleQuery {
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_candle_limit")]
    pub limit: usize,
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_candle_limit() -> usize {
    100
}

impl CandleQuery {
    fn limit(&self) -> usize {
        self.limit.min(MAX_CANDLE_HISTORY)
    }
}

// ==========================================
// Health & Status Handlers
// ==========================================

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "xtraders",
        "version": env!("CARGO_PKG_VERSION"),
        "initialized": state.app.is_initialized(),
        "startup": *state.startup.read(),
    }))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "app": state.app.status(),
        "pnl": state.app.calculate_total_pnl(),
        "auto_trader": state.auto_trader.status(),
        "connection_health": state.app.market_data().connection_health(),
    }))
}

// ==========================================
// Wallet Handlers
// ==========================================

pub async fn get_wallet(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.app.wallet_balances())
}

pub async fn transfer(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let (from, to) = match (WalletKind::parse(&req.from), WalletKind::parse(&req.to)) {
        (Ok(from), Ok(to)) => (from, to),
        (Err(e), _) | (_, Err(e)) => return wallet_error(e),
    };
    match state.app.transfer_between_wallets(from, to, req.amount) {
        Ok(tx) => Json(serde_json::json!({
            "success": true,
            "transaction": tx,
            "balances": state.app.wallet_balances(),
        }))
        .into_response(),
        Err(e) => app_error(e),
    }
}

pub async fn deposit(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DepositRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let to = match WalletKind::parse(&req.to) {
        Ok(kind) => kind,
        Err(e) => return wallet_error(e),
    };
    match state.app.wallet().deposit(to, req.amount, &req.from_address) {
        Ok(tx) => Json(serde_json::json!({ "success": true, "transaction": tx })).into_response(),
        Err(e) => wallet_error(e),
    }
}

pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<WithdrawRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let from = match WalletKind::parse(&req.from) {
        Ok(kind) => kind,
        Err(e) => return wallet_error(e),
    };
    match state.app.wallet().withdraw(from, req.amount, &req.to_address) {
        Ok(tx) => Json(serde_json::json!({ "success": true, "transaction": tx })).into_response(),
        Err(e) => wallet_error(e),
    }
}

pub async fn get_transactions(
    State(state): State<Arc<AppState>>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Response {
    let query = match query_params(query) {
        Ok(query) => query,
        Err(response) => return response,
    };
    let transactions = state.app.wallet().transaction_history(query.limit.unwrap_or(50));
    Json(serde_json::json!({
        "count": transactions.len(),
        "transactions": transactions,
    }))
    .into_response()
}

// ==========================================
// Order & Position Handlers
// ==========================================

pub async fn place_order(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OrderRequestBody>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let Some(side) = Side::parse(&req.side) else {
        return bad_request(&format!("Invalid side: {}", req.side));
    };
    let Some(order_type) = OrderType::parse(&req.order_type) else {
        return bad_request(&format!("Invalid order type: {}", req.order_type));
    };

    let result = match order_type {
        OrderType::Market => state.app.place_market_order(&req.symbol, side, req.quantity).await,
        OrderType::Limit => match req.price {
            Some(price) => state.app.place_limit_order(&req.symbol, side, req.quantity, price).await,
            None => return bad_request("Limit orders require a price"),
        },
        OrderType::StopLoss | OrderType::TakeProfit => match req.trigger_price {
            Some(trigger) => {
                state
                    .app
                    .place_conditional_order(&req.symbol, side, req.quantity, order_type, trigger)
                    .await
            }
            None => return bad_request("Conditional orders require a trigger_price"),
        },
    };

    match result {
        Ok(order) => {
            info!("API order {} {} {} {}", order.id, order.side, order.quantity, order.symbol);
            Json(serde_json::json!({ "success": true, "order": order })).into_response()
        }
        Err(e) => app_error(e),
    }
}

pub async fn get_orders(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SymbolQuery>, QueryRejection>,
) -> Response {
    let query = match query_params(query) {
        Ok(query) => query,
        Err(response) => return response,
    };
    let orders = state.app.order_history(query.symbol.as_deref());
    Json(serde_json::json!({
        "count": orders.len(),
        "orders": orders,
    }))
    .into_response()
}

pub async fn cancel_order(State(state): State<Arc<AppState>>, Path(order_id): Path<String>) -> Response {
    if state.app.cancel_order(&order_id) {
        Json(serde_json::json!({ "success": true, "order_id": order_id })).into_response()
    } else {
        bad_request(&format!("No pending order {}", order_id))
    }
}

pub async fn get_positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let positions = state.app.all_positions();
    Json(serde_json::json!({
        "count": positions.len(),
        "positions": positions,
    }))
}

pub async fn get_pnl(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.app.calculate_total_pnl())
}

// ==========================================
// Market Data Handlers
// ==========================================

pub async fn get_pairs(State(state): State<Arc<AppState>>) -> Response {
    match state.app.exchange().available_pairs().await {
        Ok(pairs) => Json(serde_json::json!({
            "exchange": state.app.exchange().name(),
            "count": pairs.len(),
            "pairs": pairs,
        }))
        .into_response(),
        Err(e) => error_response(&e.to_string()),
    }
}

pub async fn get_order_book(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> Response {
    let symbol = match path_symbol(&symbol) {
        Ok(symbol) => symbol,
        Err(response) => return response,
    };
    match state.app.exchange().order_book(&symbol).await {
        Ok(Some(book)) => {
            let snapshot = book.snapshot();
            Json(serde_json::json!({
                "symbol": snapshot.symbol,
                "bids": snapshot.bids,
                "asks": snapshot.asks,
                "timestamp": snapshot.timestamp,
                "spread": book.spread(),
                "mid_price": book.mid_price(),
                "volume": book.volume(Some(10)),
            }))
            .into_response()
        }
        Ok(None) => not_found(&format!("No order book for {}", symbol)),
        Err(e) => error_response(&e.to_string()),
    }
}

pub async fn get_candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    query: Result<Query<CandleQuery>, QueryRejection>,
) -> Response {
    let (symbol, query) = match (path_symbol(&symbol), query_params(query)) {
        (Ok(symbol), Ok(query)) => (symbol, query),
        (Err(response), _) | (_, Err(response)) => return response,
    };
    match state.app.exchange().candles(&symbol, &query.interval, query.limit()).await {
        Ok(candles) => Json(serde_json::json!({
            "symbol": symbol,
            "interval": query.interval,
            "candles": candles,
        }))
        .into_response(),
        Err(e) => error_response(&e.to_string()),
    }
}

pub async fn get_indicators(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    query: Result<Query<CandleQuery>, QueryRejection>,
) -> Response {
    let (symbol, query) = match (path_symbol(&symbol), query_params(query)) {
        (Ok(symbol), Ok(query)) => (symbol, query),
        (Err(response), _) | (_, Err(response)) => return response,
    };

    let limit = query.limit();
    let stored = state.app.market_data().candle_history(&symbol);
    let candles = if stored.len() >= limit {
        stored[stored.len() - limit..].to_vec()
    } else {
        match state.app.exchange().candles(&symbol, &query.interval, limit).await {
            Ok(candles) => candles,
            Err(e) => return error_response(&e.to_string()),
        }
    };

    let indicators = state.indicators.read().calculate(&candles);
    Json(serde_json::json!({
        "symbol": symbol,
        "candles": candles.len(),
        "indicators": indicators,
    }))
    .into_response()
}

pub async fn get_recent_trades(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Response {
    let (symbol, query) = match (path_symbol(&symbol), query_params(query)) {
        (Ok(symbol), Ok(query)) => (symbol, query),
        (Err(response), _) | (_, Err(response)) => return response,
    };
    let limit = query.limit.unwrap_or(50).min(MAX_CANDLE_HISTORY);
    match state.app.exchange().recent_trades(&symbol, limit).await {
        Ok(trades) => Json(serde_json::json!({
            "symbol": symbol,
            "trades": trades,
        }))
        .into_response(),
        Err(e) => error_response(&e.to_string()),
    }
}

pub async fn get_prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.app.market_data().last_prices())
}

/// Manual price push, marks positions and fires triggered orders
pub async fn push_price(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PriceUpdate>, JsonRejection>,
) -> Response {
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(response) => return response,
    };
    if !(update.price > 0.0) {
        return bad_request("Price must be positive");
    }
    state.app.update_market_data(&update.symbol, update.price);
    Json(serde_json::json!({
        "success": true,
        "symbol": update.symbol,
        "price": update.price,
    }))
    .into_response()
}

// ==========================================
// Auto Trader Handlers
// ==========================================

pub async fn start_auto_trader(State(state): State<Arc<AppState>>) -> Response {
    if !state.app.is_initialized() {
        return bad_request("Trading services are not initialized");
    }
    let started = state.auto_trader.start();
    Json(serde_json::json!({
        "success": started,
        "message": if started { "Auto trader started" } else { "Auto trader already running" },
        "status": state.auto_trader.status(),
    }))
    .into_response()
}

pub async fn stop_auto_trader(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.auto_trader.stop().await;
    Json(serde_json::json!({
        "success": true,
        "status": state.auto_trader.status(),
    }))
}

pub async fn get_auto_trader_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.auto_trader.status())
}

pub async fn get_active_trades(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.auto_trader.active_trades())
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config_manager.settings())
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> Response {
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(response) => return response,
    };
    match state.config_manager.update_settings(update) {
        Ok(changed) => Json(serde_json::json!({
            "success": true,
            "changed": changed,
            "settings": state.config_manager.settings(),
        }))
        .into_response(),
        Err(e) => bad_request(&e.to_string()),
    }
}
