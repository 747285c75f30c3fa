//! API module - Axum HTTP server and routes
//!
//! Serves the trading UI: wallet, orders, market data, auto trader control
//! and a WebSocket status stream.

mod handlers;
mod websocket;

use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ==========================================
        // Status & Health
        // ==========================================
        .route("/healthz", get(handlers::healthz))
        .route("/api/health", get(handlers::health_check))
        .route("/api/status", get(handlers::get_status))

        // ==========================================
        // Wallet
        // ==========================================
        .route("/api/wallet", get(handlers::get_wallet))
        .route("/api/wallet/transfer", post(handlers::transfer))
        .route("/api/wallet/deposit", post(handlers::deposit))
        .route("/api/wallet/withdraw", post(handlers::withdraw))
        .route("/api/wallet/transactions", get(handlers::get_transactions))

        // ==========================================
        // Orders & Positions
        // ==========================================
        .route("/api/orders", post(handlers::place_order).get(handlers::get_orders))
        .route("/api/orders/:order_id/cancel", post(handlers::cancel_order))
        .route("/api/positions", get(handlers::get_positions))
        .route("/api/pnl", get(handlers::get_pnl))

        // ==========================================
        // Market Data
        // ==========================================
        .route("/api/pairs", get(handlers::get_pairs))
        .route("/api/orderbook/:symbol", get(handlers::get_order_book))
        .route("/api/candles/:symbol", get(handlers::get_candles))
        .route("/api/indicators/:symbol", get(handlers::get_indicators))
        .route("/api/trades/:symbol", get(handlers::get_recent_trades))
        .route("/api/prices", post(handlers::push_price).get(handlers::get_prices))

        // ==========================================
        // Auto Trader
        // ==========================================
        .route("/api/autotrader/start", post(handlers::start_auto_trader))
        .route("/api/autotrader/stop", post(handlers::stop_auto_trader))
        .route("/api/autotrader/status", get(handlers::get_auto_trader_status))
        .route("/api/autotrader/trades", get(handlers::get_active_trades))
        .route(
            "/api/autotrader/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )

        // ==========================================
        // WebSocket for real-time updates
        // ==========================================
        .route("/ws", get(websocket::ws_handler))

        // Apply middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TradingApplication;
    use crate::config::{AppConfig, MarketDataConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state(dir: &TempDir) -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.wallet.transaction_file = dir.path().join("tx.json").display().to_string();
        config.market_data = MarketDataConfig {
            base_url: "ws://127.0.0.1:1".to_string(),
            dev_url: String::new(),
            connection_timeout_secs: 1,
            ..MarketDataConfig::default()
        };
        let settings = config.trading.clone();
        let app = TradingApplication::new(config)
            .unwrap()
            .with_retry_unit(Duration::from_millis(1));
        Arc::new(AppState::new(Arc::new(app), settings))
    }

    async fn initialized_state(dir: &TempDir) -> Arc<AppState> {
        let state = state(dir);
        state.app.initialize(2).await.unwrap();
        state
    }

    async fn call(state: &Arc<AppState>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = create_router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let (status, body) = call(&state, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&state, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["initialized"], false);
        assert_eq!(body["startup"]["server_ready"], false);
    }

    #[tokio::test]
    async fn test_orders_require_initialization() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let (status, body) = call(
            &state,
            "POST",
            "/api/orders",
            Some(json!({"symbol": "ETH/USDT", "side": "buy", "quantity": 1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_order_flow() {
        let dir = TempDir::new().unwrap();
        let state = initialized_state(&dir).await;

        let (status, body) = call(
            &state,
            "POST",
            "/api/orders",
            Some(json!({"symbol": "ETH/USDT", "side": "buy", "quantity": 2.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["order"]["fill_price"], 1950.0);

        let (_, body) = call(&state, "POST", "/api/prices", Some(json!({"symbol": "ETH/USDT", "price": 2000.0}))).await;
        assert_eq!(body["success"], true);

        let (_, body) = call(&state, "GET", "/api/positions", None).await;
        assert_eq!(body["positions"][0]["size"], 2.0);
        let (_, body) = call(&state, "GET", "/api/pnl", None).await;
        assert_eq!(body["unrealized"], 100.0);

        let (status, body) = call(
            &state,
            "POST",
            "/api/orders",
            Some(json!({"symbol": "ETH/USDT", "side": "sell", "order_type": "stop_loss", "quantity": 2.0, "trigger_price": 1900.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["order"]["id"].as_str().unwrap().to_string();

        let (_, body) = call(&state, "GET", "/api/orders?symbol=ETH/USDT", None).await;
        assert_eq!(body["orders"].as_array().unwrap().len(), 2);

        let (status, _) = call(&state, "POST", &format!("/api/orders/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&state, "POST", &format!("/api/orders/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(&state, "POST", "/api/orders/999/cancel", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_json_errors() {
        let dir = TempDir::new().unwrap();
        let state = initialized_state(&dir).await;

        for (uri, body) in [
            ("/api/wallet/transfer", json!({"from": "trading", "to": "profit", "amount": "abc"})),
            ("/api/wallet/deposit", json!({"to": "trading"})),
            ("/api/wallet/withdraw", json!({"from": "profit", "amount": [1]})),
            ("/api/orders", json!({"symbol": "ETH/USDT", "side": "buy"})),
            ("/api/prices", json!({"symbol": "ETH/USDT"})),
        ] {
            let (status, response) = call(&state, "POST", uri, Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(response["success"], false, "{}", uri);
            assert!(response["error"].is_string(), "{}", uri);
        }

        // Body that is not JSON at all
        let request = Request::builder()
            .method("POST")
            .uri("/api/orders")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = create_router(Arc::clone(&state)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (status, body) = call(&state, "GET", "/api/wallet/transactions?limit=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_order_validation() {
        let dir = TempDir::new().unwrap();
        let state = initialized_state(&dir).await;

        let (status, _) = call(
            &state,
            "POST",
            "/api/orders",
            Some(json!({"symbol": "ETH/USDT", "side": "hold", "quantity": 1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &state,
            "POST",
            "/api/orders",
            Some(json!({"symbol": "ETH/USDT", "side": "buy", "quantity": 100.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Insufficient"));
    }

    #[tokio::test]
    async fn test_wallet_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = initialized_state(&dir).await;

        let (status, body) = call(
            &state,
            "POST",
            "/api/wallet/transfer",
            Some(json!({"from": "trading", "to": "profit", "amount": "500"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transaction"]["amount"], "500");

        let (status, _) = call(
            &state,
            "POST",
            "/api/wallet/transfer",
            Some(json!({"from": "savings", "to": "profit", "amount": "1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "POST",
            "/api/wallet/withdraw",
            Some(json!({"from": "profit", "amount": "1000000", "to_address": "ext"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&state, "GET", "/api/wallet", None).await;
        assert_eq!(body["trading"], "9500");
        assert_eq!(body["profit"], "1500");

        let (_, body) = call(&state, "GET", "/api/wallet/transactions?limit=10", None).await;
        assert_eq!(body["transactions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_market_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = initialized_state(&dir).await;

        let (_, body) = call(&state, "GET", "/api/pairs", None).await;
        assert_eq!(body["pairs"].as_array().unwrap().len(), 3);

        let (status, body) = call(&state, "GET", "/api/orderbook/ETH-USDT", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "ETH/USDT");
        assert_eq!(body["bids"].as_array().unwrap().len(), 5);

        let (_, body) = call(&state, "GET", "/api/candles/BTC-USDT?limit=30", None).await;
        assert_eq!(body["candles"].as_array().unwrap().len(), 30);

        let (status, body) = call(&state, "GET", "/api/indicators/ETH-USDT?limit=60", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["indicators"]["rsi"].is_array());
        assert!(body["indicators"]["macd"]["signal"].is_array());

        let (status, _) = call(&state, "GET", "/api/orderbook/ETHUSDT", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&state, "GET", "/api/candles/ETH-USDT?limit=1000000000", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candles"].as_array().unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_auto_trader_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        // Refuses to start before the services are up
        let (status, _) = call(&state, "POST", "/api/autotrader/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &state,
            "PUT",
            "/api/autotrader/settings",
            Some(json!({"max_concurrent_trades": 5, "stop_loss": 0.1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["max_concurrent_trades"], 5);

        let (status, body) = call(
            &state,
            "PUT",
            "/api/autotrader/settings",
            Some(json!({"profit_target": 0.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (_, body) = call(&state, "GET", "/api/autotrader/status", None).await;
        assert_eq!(body["is_running"], false);
        assert_eq!(body["cycle_duration"], 300);
        assert_eq!(body["profit_target"], 2.0);
    }
}
