//! Demo wallet with trading/profit balances and a persisted transaction log
//!
//! Balances are kept as `Decimal` so repeated transfers never drift. Every
//! balance movement is appended to a JSON transaction file.

use crate::types::InitState;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_TRANSACTION_FILE: &str = "transaction_history.json";
const DEMO_TRADING_BALANCE: i64 = 10_000;
const DEMO_PROFIT_BALANCE: i64 = 1_000;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet not initialized")]
    NotInitialized,
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("Insufficient {wallet} balance: requested {requested}, available {available}")]
    InsufficientFunds {
        wallet: WalletKind,
        requested: Decimal,
        available: Decimal,
    },
    #[error("Unknown wallet: {0}")]
    UnknownWallet(String),
    #[error("Cannot transfer from {0} wallet to itself")]
    SameWallet(WalletKind),
    #[error("Invalid initial balance")]
    InvalidInitialBalance,
    #[error("Transaction history I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transaction history is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Trading,
    Profit,
}

impl WalletKind {
    pub fn parse(value: &str) -> Result<Self, WalletError> {
        match value.to_lowercase().as_str() {
            "trading" => Ok(WalletKind::Trading),
            "profit" => Ok(WalletKind::Profit),
            other => Err(WalletError::UnknownWallet(other.to_string())),
        }
    }
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletKind::Trading => write!(f, "trading"),
            WalletKind::Profit => write!(f, "profit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub from_address: String,
    pub to_address: String,
    pub currency: String,
    pub amount: String,
    pub timestamp: String,
}

/// Append-only transaction log backed by a JSON file
pub struct TransactionHistory {
    transactions: Vec<Transaction>,
    path: PathBuf,
}

impl TransactionHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            transactions: Vec::new(),
            path: path.into(),
        }
    }

    /// Load the file if it exists. A missing file is an empty history.
    pub fn load(&mut self) -> Result<(), WalletError> {
        if !self.path.exists() {
            self.transactions.clear();
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        self.transactions = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw)?
        };
        Ok(())
    }

    fn save(&self) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.transactions)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Record a transaction. The entry is kept even if persisting it fails.
    pub fn add_transaction(
        &mut self,
        from_address: &str,
        to_address: &str,
        currency: &str,
        amount: Decimal,
    ) -> Transaction {
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
            currency: currency.to_string(),
            amount: amount.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.transactions.push(tx.clone());
        if let Err(e) = self.save() {
            error!("Failed to save transaction history to {}: {}", self.path.display(), e);
        }
        tx
    }

    /// Last `limit` transactions touching `address` (0 = all)
    pub fn get_transactions(&self, address: Option<&str>, limit: usize) -> Vec<Transaction> {
        let filtered: Vec<&Transaction> = self
            .transactions
            .iter()
            .filter(|t| match address {
                Some(a) => t.from_address == a || t.to_address == a,
                None => true,
            })
            .collect();

        let skip = if limit > 0 && filtered.len() > limit {
            filtered.len() - limit
        } else {
            0
        };
        filtered.into_iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletBalances {
    pub trading: Decimal,
    pub profit: Decimal,
    pub address: String,
    pub crypto: HashMap<String, Decimal>,
}

pub type BalanceCallback = Box<dyn Fn(Decimal) + Send + Sync>;

struct WalletState {
    trading_balance: Decimal,
    profit_balance: Decimal,
    crypto_balances: HashMap<String, Decimal>,
    initialized: bool,
    init_state: InitState,
}

pub struct WalletModule {
    state: RwLock<WalletState>,
    address: String,
    history: Mutex<TransactionHistory>,
    balance_callbacks: RwLock<Vec<BalanceCallback>>,
}

impl WalletModule {
    /// Create a demo wallet (10,000 USDT trading, 1,000 USDT profit)
    pub fn new(transaction_file: impl Into<PathBuf>) -> Self {
        Self::with_balances(
            transaction_file,
            Decimal::from(DEMO_TRADING_BALANCE),
            Decimal::from(DEMO_PROFIT_BALANCE),
        )
    }

    pub fn with_balances(transaction_file: impl Into<PathBuf>, trading: Decimal, profit: Decimal) -> Self {
        Self {
            state: RwLock::new(WalletState {
                trading_balance: trading,
                profit_balance: profit,
                crypto_balances: HashMap::new(),
                initialized: false,
                init_state: InitState::NotStarted,
            }),
            address: Uuid::new_v4().to_string(),
            history: Mutex::new(TransactionHistory::new(transaction_file)),
            balance_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn initialize(&self) -> Result<(), WalletError> {
        self.state.write().init_state = InitState::Starting;
        info!("Initializing wallet {}", self.address);

        let result = self.history.lock().load().and_then(|_| {
            let state = self.state.read();
            if state.trading_balance < Decimal::ZERO || state.profit_balance < Decimal::ZERO {
                return Err(WalletError::InvalidInitialBalance);
            }
            Ok(())
        });

        let mut state = self.state.write();
        match result {
            Ok(()) => {
                state.initialized = true;
                state.init_state = InitState::Completed;
                info!(
                    "✅ Wallet initialized (trading: {} USDT, profit: {} USDT)",
                    state.trading_balance, state.profit_balance
                );
                Ok(())
            }
            Err(e) => {
                state.init_state = InitState::Failed;
                error!("Wallet initialization failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn init_state(&self) -> InitState {
        self.state.read().init_state
    }

    pub fn verify_health(&self) -> bool {
        let state = self.state.read();
        state.initialized
            && state.trading_balance >= Decimal::ZERO
            && state.profit_balance >= Decimal::ZERO
            && !self.address.is_empty()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register a callback fired with the new trading balance
    pub fn on_balance_update(&self, callback: BalanceCallback) {
        self.balance_callbacks.write().push(callback);
    }

    fn notify_balance_update(&self, balance: Decimal) {
        for callback in self.balance_callbacks.read().iter() {
            callback(balance);
        }
    }

    pub fn trading_balance(&self) -> Result<Decimal, WalletError> {
        let state = self.state.read();
        if !state.initialized {
            return Err(WalletError::NotInitialized);
        }
        Ok(state.trading_balance)
    }

    pub fn profit_balance(&self) -> Decimal {
        self.state.read().profit_balance
    }

    /// Add `delta` (may be negative) to the trading balance
    pub fn update_trading_balance(&self, delta: Decimal) -> Result<Decimal, WalletError> {
        let balance = {
            let mut state = self.state.write();
            if !state.initialized {
                return Err(WalletError::NotInitialized);
            }
            state.trading_balance += delta;
            state.trading_balance
        };
        self.notify_balance_update(balance);
        Ok(balance)
    }

    pub fn update_profit_balance(&self, delta: Decimal) -> Decimal {
        let mut state = self.state.write();
        state.profit_balance += delta;
        state.profit_balance
    }

    pub fn has_sufficient_trading_balance(&self, amount: Decimal) -> bool {
        self.state.read().trading_balance >= amount
    }

    pub fn has_sufficient_profit_balance(&self, amount: Decimal) -> bool {
        self.state.read().profit_balance >= amount
    }

    fn debit(state: &mut WalletState, wallet: WalletKind, amount: Decimal) -> Result<(), WalletError> {
        let balance = match wallet {
            WalletKind::Trading => &mut state.trading_balance,
            WalletKind::Profit => &mut state.profit_balance,
        };
        if *balance < amount {
            return Err(WalletError::InsufficientFunds {
                wallet,
                requested: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    fn credit(state: &mut WalletState, wallet: WalletKind, amount: Decimal) {
        match wallet {
            WalletKind::Trading => state.trading_balance += amount,
            WalletKind::Profit => state.profit_balance += amount,
        }
    }

    /// Move funds between the trading and profit wallets
    pub fn transfer(&self, from: WalletKind, to: WalletKind, amount: Decimal) -> Result<Transaction, WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount(amount));
        }
        if from == to {
            return Err(WalletError::SameWallet(from));
        }

        let trading = {
            let mut state = self.state.write();
            Self::debit(&mut state, from, amount)?;
            Self::credit(&mut state, to, amount);
            state.trading_balance
        };

        info!("Transferred {} USDT from {} to {}", amount, from, to);
        let tx = self
            .history
            .lock()
            .add_transaction(&self.address, &self.address, "USDT", amount);
        self.notify_balance_update(trading);
        Ok(tx)
    }

    pub fn deposit(&self, to: WalletKind, amount: Decimal, from_address: &str) -> Result<Transaction, WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount(amount));
        }

        let trading = {
            let mut state = self.state.write();
            Self::credit(&mut state, to, amount);
            state.trading_balance
        };

        info!("Deposited {} USDT into {} wallet from {}", amount, to, from_address);
        let tx = self
            .history
            .lock()
            .add_transaction(from_address, &self.address, "USDT", amount);
        self.notify_balance_update(trading);
        Ok(tx)
    }

    pub fn withdraw(&self, from: WalletKind, amount: Decimal, to_address: &str) -> Result<Transaction, WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount(amount));
        }

        let trading = {
            let mut state = self.state.write();
            Self::debit(&mut state, from, amount)?;
            state.trading_balance
        };

        info!("Withdrew {} USDT from {} wallet to {}", amount, from, to_address);
        let tx = self
            .history
            .lock()
            .add_transaction(&self.address, to_address, "USDT", amount);
        self.notify_balance_update(trading);
        Ok(tx)
    }

    /// Transactions involving this wallet, newest last
    pub fn transaction_history(&self, limit: usize) -> Vec<Transaction> {
        self.history.lock().get_transactions(Some(&self.address), limit)
    }

    pub fn crypto_balance(&self, currency: &str) -> Decimal {
        self.state
            .read()
            .crypto_balances
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn update_crypto_balance(&self, currency: &str, delta: Decimal) -> Decimal {
        let mut state = self.state.write();
        let balance = state
            .crypto_balances
            .entry(currency.to_string())
            .or_insert(Decimal::ZERO);
        *balance += delta;
        if *balance < Decimal::ZERO {
            warn!("{} balance went negative: {}", currency, balance);
        }
        *balance
    }

    pub fn balances(&self) -> WalletBalances {
        let state = self.state.read();
        WalletBalances {
            trading: state.trading_balance,
            profit: state.profit_balance,
            address: self.address.clone(),
            crypto: state.crypto_balances.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn wallet(dir: &TempDir) -> WalletModule {
        let wallet = WalletModule::new(dir.path().join("tx.json"));
        wallet.initialize().unwrap();
        wallet
    }

    #[test]
    fn test_requires_initialization() {
        let dir = TempDir::new().unwrap();
        let wallet = WalletModule::new(dir.path().join("tx.json"));
        assert!(matches!(wallet.trading_balance(), Err(WalletError::NotInitialized)));
        assert!(matches!(
            wallet.update_trading_balance(Decimal::ONE),
            Err(WalletError::NotInitialized)
        ));
        assert_eq!(wallet.init_state(), InitState::NotStarted);
        assert!(!wallet.verify_health());
    }

    #[test]
    fn test_demo_balances() {
        let dir = TempDir::new().unwrap();
        let wallet = wallet(&dir);
        assert_eq!(wallet.trading_balance().unwrap(), Decimal::from(10_000));
        assert_eq!(wallet.profit_balance(), Decimal::from(1_000));
        assert_eq!(wallet.init_state(), InitState::Completed);
        assert!(wallet.verify_health());
    }

    #[test]
    fn test_transfer_rules() {
        let dir = TempDir::new().unwrap();
        let wallet = wallet(&dir);

        wallet
            .transfer(WalletKind::Trading, WalletKind::Profit, Decimal::from(500))
            .unwrap();
        assert_eq!(wallet.trading_balance().unwrap(), Decimal::from(9_500));
        assert_eq!(wallet.profit_balance(), Decimal::from(1_500));

        assert!(matches!(
            wallet.transfer(WalletKind::Profit, WalletKind::Trading, Decimal::ZERO),
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            wallet.transfer(WalletKind::Profit, WalletKind::Trading, Decimal::from(2_000)),
            Err(WalletError::InsufficientFunds { wallet: WalletKind::Profit, .. })
        ));
        assert!(matches!(
            wallet.transfer(WalletKind::Profit, WalletKind::Profit, Decimal::ONE),
            Err(WalletError::SameWallet(_))
        ));
        assert_eq!(wallet.transaction_history(0).len(), 1);
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let dir = TempDir::new().unwrap();
        let wallet = wallet(&dir);

        let tx = wallet
            .deposit(WalletKind::Profit, Decimal::from(250), "external")
            .unwrap();
        assert_eq!(tx.from_address, "external");
        assert_eq!(tx.to_address, wallet.address());
        assert_eq!(tx.amount, "250");
        assert_eq!(wallet.profit_balance(), Decimal::from(1_250));

        wallet
            .withdraw(WalletKind::Trading, Decimal::from(100), "0xabc")
            .unwrap();
        assert_eq!(wallet.trading_balance().unwrap(), Decimal::from(9_900));
        assert!(wallet
            .withdraw(WalletKind::Trading, Decimal::from(1_000_000), "0xabc")
            .is_err());
        assert!(WalletKind::parse("savings").is_err());
    }

    #[test]
    fn test_history_persists_and_limits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.json");
        {
            let wallet = WalletModule::new(&path);
            wallet.initialize().unwrap();
            for _ in 0..5 {
                wallet.deposit(WalletKind::Trading, Decimal::ONE, "external").unwrap();
            }
            assert_eq!(wallet.transaction_history(3).len(), 3);
        }

        let mut history = TransactionHistory::new(&path);
        history.load().unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history.get_transactions(Some("external"), 2).len(), 2);
        assert_eq!(history.get_transactions(Some("nobody"), 0).len(), 0);
        assert_eq!(history.get_transactions(None, 0).len(), 5);
    }

    #[test]
    fn test_corrupt_history_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.json");
        std::fs::write(&path, "{not json").unwrap();

        let wallet = WalletModule::new(&path);
        assert!(matches!(wallet.initialize(), Err(WalletError::Json(_))));
        assert_eq!(wallet.init_state(), InitState::Failed);
    }

    #[test]
    fn test_balance_callback_fires() {
        let dir = TempDir::new().unwrap();
        let wallet = wallet(&dir);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        wallet.on_balance_update(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        wallet.update_trading_balance(Decimal::from(-50)).unwrap();
        wallet.deposit(WalletKind::Trading, Decimal::ONE, "external").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_crypto_balances() {
        let dir = TempDir::new().unwrap();
        let wallet = wallet(&dir);
        assert_eq!(wallet.crypto_balance("BTC"), Decimal::ZERO);
        wallet.update_crypto_balance("BTC", Decimal::new(5, 1));
        assert_eq!(wallet.crypto_balance("BTC"), Decimal::new(5, 1));
        assert_eq!(wallet.balances().crypto.len(), 1);
    }
}
