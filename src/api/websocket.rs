//! WebSocket handler for real-time updates to the UI
//!
//! Pushes a status snapshot every second:
//! - Wallet balances
//! - Open positions and PnL
//! - Connection statuses
//! - Auto trader state

use crate::app::AppStatus;
use crate::trading::{AutoTraderStatus, PnlSummary};
use crate::types::Position;
use crate::wallet::WalletBalances;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    info!("WebSocket client connected");

    // Spawn task to send periodic updates (first tick fires immediately)
    let state_clone = Arc::clone(&state);
    let mut send_task = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));

        loop {
            ticker.tick().await;

            let update = status_update(&state_clone);

            match serde_json::to_string(&update) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize WebSocket update: {}", e);
                }
            }
        }
    });

    // Handle incoming messages (pings, commands)
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!("Received WebSocket message: {}", text);
                }
                Ok(Message::Ping(_)) => {
                    debug!("Received ping");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket client requested close");
                    break;
                }
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}

/// WebSocket update payload
#[derive(Debug, Serialize)]
pub(crate) struct StatusUpdate {
    #[serde(rename = "type")]
    update_type: &'static str,
    timestamp: String,
    data: StatusData,
}

#[derive(Debug, Serialize)]
struct StatusData {
    app: AppStatus,
    balances: WalletBalances,
    positions: Vec<Position>,
    pnl: PnlSummary,
    last_prices: HashMap<String, f64>,
    auto_trader: AutoTraderStatus,
}

pub(crate) fn status_update(state: &AppState) -> StatusUpdate {
    StatusUpdate {
        update_type: "status",
        timestamp: chrono::Utc::now().to_rfc3339(),
        data: StatusData {
            app: state.app.status(),
            balances: state.app.wallet_balances(),
            positions: state.app.all_positions(),
            pnl: state.app.calculate_total_pnl(),
            last_prices: state.app.market_data().last_prices(),
            auto_trader: state.auto_trader.status(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TradingApplication;
    use crate::config::AppConfig;
    use tempfile::TempDir;

    #[test]
    fn test_status_update_payload() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.wallet.transaction_file = dir.path().join("tx.json").display().to_string();
        let settings = config.trading.clone();
        let app = Arc::new(TradingApplication::new(config).unwrap());
        let state = AppState::new(app, settings);
        state.app.update_market_data("ETH/USDT", 1950.0);

        let json = serde_json::to_value(status_update(&state)).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["app"]["initialized"], false);
        assert_eq!(json["data"]["balances"]["trading"], "10000");
        assert_eq!(json["data"]["last_prices"]["ETH/USDT"], 1950.0);
        assert_eq!(json["data"]["auto_trader"]["is_running"], false);
        assert!(json["data"]["positions"].as_array().unwrap().is_empty());
    }
}
