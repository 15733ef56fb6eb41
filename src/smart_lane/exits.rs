//! Exit strategy generation
//!
//! Builds an ordered set of exit levels (stop-loss first, take-profit
//! tiers, optional time and volatility exits), a trailing-stop config and
//! emergency conditions. Take-profit allocations always sum to 100%;
//! validation fixes them up when rounding drifts.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::SmartLaneConfig;

/// Market crash threshold for the emergency exit: -20% in 15 minutes
const CRASH_DROP_PCT: f64 = 20.0;
const CRASH_WINDOW_MINUTES: u32 = 15;
/// Spread beyond this marks a liquidity crisis
const CRISIS_SPREAD_PCT: f64 = 2.0;
/// Risk-score deterioration that forces an exit review
const RISK_DETERIORATION: f64 = 0.2;

/// Trailing stops require this much position value to be worth the churn
const TRAILING_MIN_POSITION_USD: f64 = 5_000.0;

/// What fires an exit level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
    TimeLimit,
    VolatilitySpike,
    TrailingStop,
    Emergency,
}

/// A single exit level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitLevel {
    pub trigger: ExitTrigger,
    /// Price move from entry that fires this level (negative = loss)
    pub price_move_percent: f64,
    /// Share of the position to close when fired
    pub position_percent: f64,
}

/// Strategy families by tier count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Conservative,
    Balanced,
    Aggressive,
    Scaled,
}

impl StrategyType {
    fn tier_count(&self) -> usize {
        match self {
            StrategyType::Conservative => 1,
            StrategyType::Balanced => 2,
            StrategyType::Aggressive => 3,
            StrategyType::Scaled => 4,
        }
    }
}

/// Broad market regime fed in from market analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Bull,
    Bear,
    #[default]
    Sideways,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Profit percent at which the trail activates
    pub activation_percent: f64,
    /// Distance from the peak that fires the trail
    pub trail_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConditions {
    pub crash_drop_pct: f64,
    pub crash_window_minutes: u32,
    pub max_spread_pct: f64,
    pub risk_deterioration: f64,
}

impl Default for EmergencyConditions {
    fn default() -> Self {
        Self {
            crash_drop_pct: CRASH_DROP_PCT,
            crash_window_minutes: CRASH_WINDOW_MINUTES,
            max_spread_pct: CRISIS_SPREAD_PCT,
            risk_deterioration: RISK_DETERIORATION,
        }
    }
}

/// Inputs to strategy generation
#[derive(Debug, Clone, Default)]
pub struct ExitInputs {
    pub risk_score: f64,
    pub confidence: f64,
    pub volatility: f64,
    /// Broad market stress estimate in [0, 1]
    pub market_stress: f64,
    pub regime: MarketRegime,
    /// Pool liquidity quality in [0, 1] (1 = deep)
    pub liquidity_score: f64,
    pub position_size_usd: Decimal,
}

/// The generated exit plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitStrategy {
    pub strategy_type: StrategyType,
    /// Stop-loss first, then take-profit tiers, then optional extras
    pub levels: Vec<ExitLevel>,
    pub trailing: TrailingStopConfig,
    pub emergency: EmergencyConditions,
    pub max_hold_time_hours: Option<f64>,
    pub stop_loss_percent: f64,
}

impl ExitStrategy {
    pub fn take_profit_levels(&self) -> impl Iterator<Item = &ExitLevel> {
        self.levels
            .iter()
            .filter(|l| l.trigger == ExitTrigger::TakeProfit)
    }

    pub fn take_profit_allocation(&self) -> f64 {
        self.take_profit_levels().map(|l| l.position_percent).sum()
    }

    pub fn has_stop_loss(&self) -> bool {
        self.levels.iter().any(|l| l.trigger == ExitTrigger::StopLoss)
    }
}

pub struct ExitStrategyManager {
    config: SmartLaneConfig,
}

impl ExitStrategyManager {
    pub fn new(config: SmartLaneConfig) -> Self {
        Self { config }
    }

    /// Generate an exit strategy; any internal inconsistency is repaired
    /// by the validation pass, and a degenerate input set falls back to a
    /// conservative single-tier plan.
    pub fn generate(&self, inputs: &ExitInputs) -> ExitStrategy {
        let strategy_type = Self::select_type(inputs);
        let stop_loss = self.stop_loss_percent(inputs);

        let mut levels = vec![ExitLevel {
            trigger: ExitTrigger::StopLoss,
            price_move_percent: -stop_loss,
            position_percent: 100.0,
        }];
        levels.extend(self.take_profit_tiers(strategy_type, inputs));

        // Riskier positions get a shelf life.
        let max_hold_time_hours = if inputs.risk_score > 0.6 {
            Some(4.0)
        } else if inputs.risk_score > 0.4 {
            Some(24.0)
        } else {
            None
        };
        if max_hold_time_hours.is_some() {
            levels.push(ExitLevel {
                trigger: ExitTrigger::TimeLimit,
                price_move_percent: 0.0,
                position_percent: 100.0,
            });
        }

        if inputs.volatility > 0.3 {
            levels.push(ExitLevel {
                trigger: ExitTrigger::VolatilitySpike,
                price_move_percent: 0.0,
                position_percent: 50.0,
            });
        }

        let strategy = ExitStrategy {
            strategy_type,
            levels,
            trailing: self.trailing_config(inputs),
            emergency: EmergencyConditions::default(),
            max_hold_time_hours,
            stop_loss_percent: stop_loss,
        };

        self.validate_and_fix(strategy, inputs)
    }

    fn select_type(inputs: &ExitInputs) -> StrategyType {
        if inputs.risk_score > 0.6 || inputs.confidence < 0.4 {
            StrategyType::Conservative
        } else if inputs.risk_score < 0.25 && inputs.confidence > 0.75 {
            StrategyType::Aggressive
        } else if inputs.position_size_usd.to_f64().unwrap_or(0.0) > 10_000.0 {
            StrategyType::Scaled
        } else {
            StrategyType::Balanced
        }
    }

    /// stop% = clamp(min, max, default + 10·risk + 20·volatility + 5·stress)
    fn stop_loss_percent(&self, inputs: &ExitInputs) -> f64 {
        let raw = self.config.default_stop_loss_percent
            + 10.0 * inputs.risk_score
            + 20.0 * inputs.volatility
            + 5.0 * inputs.market_stress;
        raw.clamp(
            self.config.min_stop_loss_percent,
            self.config.max_stop_loss_percent,
        )
    }

    fn take_profit_tiers(&self, strategy_type: StrategyType, inputs: &ExitInputs) -> Vec<ExitLevel> {
        let count = strategy_type.tier_count();

        // Gain targets stretch with confidence and shrink with risk.
        let first_target = (10.0 + 20.0 * inputs.confidence - 5.0 * inputs.risk_score).max(2.0);
        let spacing = match strategy_type {
            StrategyType::Conservative => 0.0,
            StrategyType::Balanced => first_target,
            StrategyType::Aggressive => first_target * 1.5,
            StrategyType::Scaled => first_target,
        };

        let allocation = 100.0 / count as f64;
        (0..count)
            .map(|i| ExitLevel {
                trigger: ExitTrigger::TakeProfit,
                price_move_percent: (first_target + spacing * i as f64).min(500.0),
                position_percent: allocation,
            })
            .collect()
    }

    fn trailing_config(&self, inputs: &ExitInputs) -> TrailingStopConfig {
        let low_risk_bull = inputs.risk_score < 0.3 && inputs.regime == MarketRegime::Bull;
        let deep_and_large = inputs.liquidity_score > 0.7
            && inputs.position_size_usd.to_f64().unwrap_or(0.0) > TRAILING_MIN_POSITION_USD;
        let calm = inputs.volatility < 0.1 && inputs.market_stress < 0.3;

        TrailingStopConfig {
            enabled: low_risk_bull || deep_and_large || calm,
            activation_percent: 10.0 + 10.0 * inputs.volatility,
            trail_percent: (5.0 + 20.0 * inputs.volatility).min(20.0),
        }
    }

    /// Enforce the exit invariants, repairing what can be repaired.
    fn validate_and_fix(&self, mut strategy: ExitStrategy, inputs: &ExitInputs) -> ExitStrategy {
        // Stop-loss must exist and sit in [-50, -2].
        if !strategy.has_stop_loss() {
            return self.fallback(inputs);
        }
        for level in strategy.levels.iter_mut() {
            match level.trigger {
                ExitTrigger::StopLoss => {
                    level.price_move_percent = level.price_move_percent.clamp(-50.0, -2.0);
                }
                ExitTrigger::TakeProfit => {
                    level.price_move_percent = level.price_move_percent.clamp(2.0, 500.0);
                }
                _ => {}
            }
        }

        // Take-profit allocations sum to 100; scale drifts back.
        let total = strategy.take_profit_allocation();
        if total > 0.0 && (total - 100.0).abs() > 1.0 {
            let scale = 100.0 / total;
            for level in strategy.levels.iter_mut() {
                if level.trigger == ExitTrigger::TakeProfit {
                    level.position_percent *= scale;
                }
            }
        } else if total <= 0.0 {
            return self.fallback(inputs);
        }

        strategy
    }

    /// Single-tier conservative plan used when generation degenerates
    fn fallback(&self, inputs: &ExitInputs) -> ExitStrategy {
        let stop_loss = self.stop_loss_percent(inputs);
        ExitStrategy {
            strategy_type: StrategyType::Conservative,
            levels: vec![
                ExitLevel {
                    trigger: ExitTrigger::StopLoss,
                    price_move_percent: -stop_loss.clamp(2.0, 50.0),
                    position_percent: 100.0,
                },
                ExitLevel {
                    trigger: ExitTrigger::TakeProfit,
                    price_move_percent: 10.0,
                    position_percent: 100.0,
                },
            ],
            trailing: TrailingStopConfig {
                enabled: false,
                activation_percent: 10.0,
                trail_percent: 5.0,
            },
            emergency: EmergencyConditions::default(),
            max_hold_time_hours: Some(4.0),
            stop_loss_percent: stop_loss,
        }
    }
}
