//! Trading module - simulated order execution and automated trading
//!
//! The engine owns orders and positions; the auto trader drives the engine
//! from indicator signals.

mod auto_trader;
mod engine;

pub use auto_trader::{
    find_arbitrage_opportunities, ActiveTrade, ArbitrageOpportunity, AutoTrader, AutoTraderStatus, Momentum,
    TradeKind, Trend,
};
pub use engine::{EngineComponents, EngineError, OrderRequest, PnlSummary, PositionEvent, TradingEngine};
