//! XTraders - simulated crypto trading platform
//!
//! Wallet, trading engine, exchange connectors, market data feed, auto
//! trader and the HTTP/WebSocket UI server that fronts them.

pub mod api;
pub mod app;
pub mod config;
pub mod config_manager;
pub mod exchange;
pub mod indicators;
pub mod launcher;
pub mod market_data;
pub mod order_book;
pub mod port_utils;
pub mod trading;
pub mod types;
pub mod wallet;

use crate::app::TradingApplication;
use crate::config::TradingSettings;
use crate::config_manager::ConfigManager;
use crate::indicators::TechnicalIndicators;
use crate::launcher::StartupState;
use crate::trading::AutoTrader;

use parking_lot::RwLock;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    pub app: Arc<TradingApplication>,
    pub config_manager: Arc<ConfigManager>,
    pub auto_trader: Arc<AutoTrader>,
    pub indicators: RwLock<TechnicalIndicators>,
    pub startup: RwLock<StartupState>,
}

impl AppState {
    pub fn new(app: Arc<TradingApplication>, settings: TradingSettings) -> Self {
        let config_manager = Arc::new(ConfigManager::new(settings));
        let auto_trader = Arc::new(AutoTrader::new(Arc::clone(&app), Arc::clone(&config_manager)));
        Self {
            app,
            config_manager,
            auto_trader,
            indicators: RwLock::new(TechnicalIndicators::with_defaults()),
            startup: RwLock::new(StartupState::default()),
        }
    }
}
