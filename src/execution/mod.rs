//! Trade execution
//!
//! The fast lane: a bounded queue of trade decisions drained by a small
//! worker pool, each trade validated, risk-checked from cache, gas-planned,
//! signed and routed (private relay or public mempool) inside a hard
//! per-trade deadline.

pub mod executor;
pub mod gas;
pub mod nonce;
pub mod router;
pub mod types;

pub use executor::{ExecutorStatus, FastLaneExecutor};
pub use gas::{GasOptimizer, GasPlan};
pub use nonce::NonceManager;
pub use types::{
    TradeAction, TradeDecision, TradeExecution, TradeOutcome, TradePriority, TradeStatus,
};
