//! Circuit breakers
//!
//! Global trading halts on loss thresholds with typed auto-recovery
//! windows. An active breaker blocks every new position-opening decision
//! until it recovers or an operator resets it; open positions continue to
//! be monitored throughout.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerType {
    DailyLoss,
    PortfolioLoss,
    ConsecutiveLosses,
    Volatility,
    External,
}

impl BreakerType {
    /// Auto-recovery delay; `None` requires manual reset
    fn recovery_window(&self) -> Option<Duration> {
        match self {
            BreakerType::DailyLoss => Some(Duration::hours(24)),
            BreakerType::ConsecutiveLosses => Some(Duration::hours(4)),
            BreakerType::PortfolioLoss | BreakerType::Volatility | BreakerType::External => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerEvent {
    pub breaker_type: BreakerType,
    pub trigger_value: Decimal,
    pub threshold_value: Decimal,
    pub description: String,
    pub triggered_at: DateTime<Utc>,
    pub auto_recovery_at: Option<DateTime<Utc>>,
}

/// Inputs evaluated on every trade-result update
#[derive(Debug, Clone, Default)]
pub struct BreakerInputs {
    pub daily_pnl: Decimal,
    pub cumulative_pnl: Decimal,
    pub consecutive_losses: u32,
    /// Realized portfolio volatility estimate in [0, 1]
    pub portfolio_volatility: f64,
}

pub struct CircuitBreakerManager {
    /// Loss limits in absolute USD, derived from the configured percents
    daily_loss_limit_usd: Decimal,
    portfolio_loss_limit_usd: Decimal,
    consecutive_loss_limit: u32,
    volatility_limit: f64,
    active: Vec<CircuitBreakerEvent>,
    manual_override: bool,
}

impl CircuitBreakerManager {
    pub fn new(
        daily_loss_limit_usd: Decimal,
        portfolio_loss_limit_usd: Decimal,
        consecutive_loss_limit: u32,
        volatility_limit: f64,
    ) -> Self {
        Self {
            daily_loss_limit_usd,
            portfolio_loss_limit_usd,
            consecutive_loss_limit,
            volatility_limit,
            active: Vec::new(),
            manual_override: false,
        }
    }

    /// Evaluate all thresholds; newly breached ones activate.
    pub fn check(&mut self, inputs: &BreakerInputs) -> Vec<CircuitBreakerEvent> {
        let mut fired = Vec::new();

        if inputs.daily_pnl <= -self.daily_loss_limit_usd {
            fired.extend(self.activate(
                BreakerType::DailyLoss,
                inputs.daily_pnl,
                -self.daily_loss_limit_usd,
                format!("daily P&L {} breached limit", inputs.daily_pnl),
            ));
        }

        if inputs.cumulative_pnl <= -self.portfolio_loss_limit_usd {
            fired.extend(self.activate(
                BreakerType::PortfolioLoss,
                inputs.cumulative_pnl,
                -self.portfolio_loss_limit_usd,
                format!("portfolio P&L {} breached limit", inputs.cumulative_pnl),
            ));
        }

        if inputs.consecutive_losses >= self.consecutive_loss_limit {
            fired.extend(self.activate(
                BreakerType::ConsecutiveLosses,
                Decimal::from(inputs.consecutive_losses),
                Decimal::from(self.consecutive_loss_limit),
                format!("{} consecutive losing trades", inputs.consecutive_losses),
            ));
        }

        if inputs.portfolio_volatility >= self.volatility_limit {
            fired.extend(self.activate(
                BreakerType::Volatility,
                Decimal::try_from(inputs.portfolio_volatility).unwrap_or_default(),
                Decimal::try_from(self.volatility_limit).unwrap_or_default(),
                "portfolio volatility spike".to_string(),
            ));
        }

        fired
    }

    /// Operator-initiated halt.
    pub fn trigger_external(&mut self, reason: &str) -> CircuitBreakerEvent {
        self.activate(
            BreakerType::External,
            Decimal::ZERO,
            Decimal::ZERO,
            reason.to_string(),
        )
        .unwrap_or_else(|| {
            self.active
                .iter()
                .find(|b| b.breaker_type == BreakerType::External)
                .cloned()
                .expect("external breaker active after trigger")
        })
    }

    fn activate(
        &mut self,
        breaker_type: BreakerType,
        trigger_value: Decimal,
        threshold_value: Decimal,
        description: String,
    ) -> Option<CircuitBreakerEvent> {
        if self.active.iter().any(|b| b.breaker_type == breaker_type) {
            return None;
        }

        let triggered_at = Utc::now();
        let event = CircuitBreakerEvent {
            breaker_type,
            trigger_value,
            threshold_value,
            description,
            triggered_at,
            auto_recovery_at: breaker_type.recovery_window().map(|w| triggered_at + w),
        };

        warn!(
            breaker = ?breaker_type,
            trigger = %event.trigger_value,
            "Circuit breaker tripped"
        );
        self.active.push(event.clone());
        Some(event)
    }

    /// Whether trading is allowed right now. Expired auto-recovery
    /// windows clear their breakers as a side effect.
    pub fn can_trade(&mut self) -> (bool, Vec<String>) {
        if self.manual_override {
            return (true, vec!["manual override active".to_string()]);
        }

        let now = Utc::now();
        self.active.retain(|b| {
            let recovered = b.auto_recovery_at.map(|at| now >= at).unwrap_or(false);
            if recovered {
                info!(breaker = ?b.breaker_type, "Circuit breaker auto-recovered");
            }
            !recovered
        });

        if self.active.is_empty() {
            (true, Vec::new())
        } else {
            let reasons = self
                .active
                .iter()
                .map(|b| format!("{:?}: {}", b.breaker_type, b.description))
                .collect();
            (false, reasons)
        }
    }

    /// Operator reset; clears one type or everything.
    pub fn manual_reset(&mut self, breaker_type: Option<BreakerType>) -> usize {
        let before = self.active.len();
        match breaker_type {
            Some(t) => self.active.retain(|b| b.breaker_type != t),
            None => self.active.clear(),
        }
        before - self.active.len()
    }

    pub fn set_manual_override(&mut self, enabled: bool) {
        if enabled {
            warn!("Circuit breaker manual override ENABLED");
        }
        self.manual_override = enabled;
    }

    pub fn active_breakers(&self) -> &[CircuitBreakerEvent] {
        &self.active
    }
}
