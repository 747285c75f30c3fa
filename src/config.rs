//! Application configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! environment variables (after `.env` is loaded), then CLI flags applied by
//! the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
    #[error("Invalid trading setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How many ports above `port` to try when it is taken
    pub port_search_range: u16,
    pub health_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8502,
            port_search_range: 100,
            health_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub dev_url: String,
    pub heartbeat_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub connection_timeout_secs: u64,
    pub recovery_cooldown_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://api.xtraders.com".to_string(),
            dev_url: "wss://api-dev.xtraders.com".to_string(),
            heartbeat_interval_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_delay_secs: 5,
            connection_timeout_secs: 30,
            recovery_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Exchange used by the application ("sushiswap", "binance", "kucoin")
    pub default: String,
    /// Open the exchange's public WebSocket stream on connect
    pub live_stream: bool,
    pub binance: Credentials,
    pub kucoin: Credentials,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            default: "sushiswap".to_string(),
            live_stream: false,
            binance: Credentials::default(),
            kucoin: Credentials::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub transaction_file: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            transaction_file: crate::wallet::DEFAULT_TRANSACTION_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Run the UI server only, without trading services
    pub standalone: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 2,
            standalone: false,
        }
    }
}

/// Runtime-tunable auto trader and risk parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TradingSettings {
    pub profit_target: f64,
    pub cycle_duration_secs: u64,
    pub min_price_difference: f64,
    pub max_concurrent_trades: usize,
    pub stop_loss: f64,
    /// Share of trading balance committed per smart trade
    pub position_fraction: f64,
    /// Share of trading balance committed per arbitrage leg
    pub arbitrage_fraction: f64,
    pub trend_short: usize,
    pub trend_medium: usize,
    pub trend_long: usize,
    pub min_candles: usize,
    pub monitor_interval_ms: u64,
}

impl TradingSettings {
    /// Reject values that would make every trade exit on the next monitor tick
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name, reason| Err(ConfigError::InvalidSetting { name, reason });
        if !self.profit_target.is_finite() || self.profit_target <= 1.0 {
            return invalid("profit_target", "must be a finite multiple above 1");
        }
        if !self.min_price_difference.is_finite() || self.min_price_difference <= 0.0 {
            return invalid("min_price_difference", "must be positive");
        }
        if self.max_concurrent_trades == 0 {
            return invalid("max_concurrent_trades", "must be at least 1");
        }
        if !(self.stop_loss > 0.0 && self.stop_loss < 1.0) {
            return invalid("stop_loss", "must be between 0 and 1");
        }
        if !(self.position_fraction > 0.0 && self.position_fraction <= 1.0) {
            return invalid("position_fraction", "must be in (0, 1]");
        }
        if !(self.arbitrage_fraction > 0.0 && self.arbitrage_fraction <= 1.0) {
            return invalid("arbitrage_fraction", "must be in (0, 1]");
        }
        Ok(())
    }
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            profit_target: 2.0,
            cycle_duration_secs: 300,
            min_price_difference: 0.002,
            max_concurrent_trades: 3,
            stop_loss: 0.05,
            position_fraction: 0.2,
            arbitrage_fraction: 0.1,
            trend_short: 20,
            trend_medium: 50,
            trend_long: 200,
            min_candles: 200,
            monitor_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub market_data: MarketDataConfig,
    pub exchange: ExchangeConfig,
    pub wallet: WalletConfig,
    pub startup: StartupConfig,
    pub trading: TradingSettings,
}

impl AppConfig {
    /// Load defaults, an optional TOML file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.trading.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&raw)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is injectable for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("XTRADERS_HOST") {
            self.server.host = host;
        }
        // Both names are honoured; the second matches the legacy UI server
        for key in ["XTRADERS_PORT", "STREAMLIT_SERVER_PORT"] {
            if let Some(value) = lookup(key) {
                self.server.port = value.parse().map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value: value.clone(),
                })?;
                break;
            }
        }
        if let Some(url) = lookup("XTRADERS_WS_URL") {
            self.market_data.base_url = url;
        }
        if let Some(url) = lookup("XTRADERS_WS_DEV_URL") {
            self.market_data.dev_url = url;
        }
        if let Some(path) = lookup("XTRADERS_TRANSACTIONS_FILE") {
            self.wallet.transaction_file = path;
        }
        if let Some(exchange) = lookup("XTRADERS_EXCHANGE") {
            self.exchange.default = exchange.to_lowercase();
        }

        if let Some(key) = lookup("BINANCE_API_KEY") {
            self.exchange.binance.api_key = Some(key);
        }
        if let Some(secret) = lookup("BINANCE_API_SECRET") {
            self.exchange.binance.api_secret = Some(secret);
        }
        if let Some(key) = lookup("KUCOIN_API_KEY") {
            self.exchange.kucoin.api_key = Some(key);
        }
        if let Some(secret) = lookup("KUCOIN_API_SECRET") {
            self.exchange.kucoin.api_secret = Some(secret);
        }
        if let Some(passphrase) = lookup("KUCOIN_API_PASSPHRASE") {
            self.exchange.kucoin.passphrase = Some(passphrase);
        }

        if self.server.port == 0 {
            warn!("Port 0 configured, an ephemeral port will be chosen");
        }
        Ok(())
    }
}
