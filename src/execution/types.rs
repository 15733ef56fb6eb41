//! Execution data model

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discovery::PairId;

/// What to do with a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Skip,
}

/// Execution urgency; drives gas pricing and relay routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradePriority {
    Standard,
    High,
    Urgent,
}

/// A decision handed to the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub pair_id: PairId,
    pub token_address: Address,
    pub action: TradeAction,
    pub confidence_score: f64,
    pub position_size_usd: Decimal,
    pub max_slippage_percent: Decimal,
    pub priority: TradePriority,
    pub correlation_id: Uuid,
}

impl TradeDecision {
    pub fn chain_id(&self) -> u64 {
        self.pair_id.chain_id
    }
}

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// Terminal outcome of a completed or failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeOutcome {
    Success,
    Failed,
    Timeout,
    Rejected,
    SlippageExceeded,
    InsufficientFunds,
}

/// Execution record kept for the retention window and published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecution {
    pub trade_id: Uuid,
    pub decision: TradeDecision,
    pub status: TradeStatus,
    pub outcome: Option<TradeOutcome>,
    pub tx_hash: Option<H256>,
    pub amount_out: Option<U256>,
    pub actual_slippage_percent: Option<Decimal>,
    pub gas_used: Option<U256>,
    pub execution_time_ms: u64,
    /// Populated in paper mode to describe the simulated fill
    pub simulation_notes: Option<String>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TradeExecution {
    pub fn pending(decision: TradeDecision) -> Self {
        Self {
            trade_id: Uuid::new_v4(),
            decision,
            status: TradeStatus::Pending,
            outcome: None,
            tx_hash: None,
            amount_out: None,
            actual_slippage_percent: None,
            gas_used: None,
            execution_time_ms: 0,
            simulation_notes: None,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn finish(&mut self, status: TradeStatus, outcome: TradeOutcome) {
        self.status = status;
        self.outcome = Some(outcome);
        self.completed_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TradeStatus::Completed | TradeStatus::Failed | TradeStatus::Cancelled
        )
    }
}
