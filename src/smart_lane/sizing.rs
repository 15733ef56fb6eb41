//! Position sizing
//!
//! Picks a sizing method from portfolio and market conditions, applies the
//! adjustment chain and clamps the result. Returns the full calculation so
//! callers can explain the size instead of reconstructing it.

use serde::{Deserialize, Serialize};

use crate::config::SmartLaneConfig;

use super::technical::{SignalDirection, TechnicalSummary};

/// Kelly is scaled down to a quarter of the raw fraction
const KELLY_MULTIPLIER: f64 = 0.25;
const KELLY_MIN_WIN_RATE: f64 = 0.55;
const KELLY_MIN_TRADES: usize = 10;

/// Portfolio heat above this forces the risk-based method
const HEAT_METHOD_THRESHOLD: f64 = 15.0;
/// Volatility above this forces the volatility-adjusted method
const HIGH_VOLATILITY: f64 = 0.25;
/// Confidence below this forces the confidence-weighted method
const LOW_CONFIDENCE: f64 = 0.5;

/// Sizing methodologies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingMethod {
    FixedPercent,
    RiskBased,
    KellyCriterion,
    VolatilityAdjusted,
    ConfidenceWeighted,
    PortfolioHeat,
}

/// Inputs to a sizing decision
#[derive(Debug, Clone, Default)]
pub struct SizingInputs {
    pub risk_score: f64,
    pub confidence: f64,
    pub technical: TechnicalSummary,
    /// Annualized-ish volatility estimate in [0, 1]
    pub volatility: f64,
    /// Current portfolio heat (percent of capital at risk)
    pub portfolio_heat_pct: f64,
    /// Maximum tolerable heat
    pub max_heat_pct: f64,
    pub open_positions: usize,
    /// Past trade P&L fractions (positive = win) for Kelly
    pub pnl_history: Vec<f64>,
}

/// The full sizing calculation, returned instead of kept as hidden state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingCalculation {
    pub method: SizingMethod,
    pub base_percent: f64,
    pub risk_factor: f64,
    pub confidence_factor: f64,
    pub technical_factor: f64,
    pub volatility_factor: f64,
    pub heat_constraint: f64,
    pub final_percent: f64,
    pub warnings: Vec<String>,
}

pub struct PositionSizer {
    config: SmartLaneConfig,
}

impl PositionSizer {
    pub fn new(config: SmartLaneConfig) -> Self {
        Self { config }
    }

    /// Calculate the position size as a percent of maximum position value.
    pub fn calculate(&self, inputs: &SizingInputs) -> SizingCalculation {
        let mut warnings = Vec::new();

        // Capacity exhausted: size is zero, full stop.
        if inputs.open_positions >= self.config.max_positions {
            warnings.push(format!(
                "position capacity exhausted ({}/{})",
                inputs.open_positions, self.config.max_positions
            ));
            return SizingCalculation {
                method: SizingMethod::FixedPercent,
                base_percent: 0.0,
                risk_factor: 0.0,
                confidence_factor: 0.0,
                technical_factor: 0.0,
                volatility_factor: 0.0,
                heat_constraint: 0.0,
                final_percent: 0.0,
                warnings,
            };
        }

        let method = self.select_method(inputs);
        let base = self.base_size(method, inputs);

        // Adjustment chain
        let risk_factor = 1.0 - 0.5 * inputs.risk_score.clamp(0.0, 1.0);
        let confidence_factor = 0.5 + 0.5 * inputs.confidence.clamp(0.0, 1.0);
        let technical_factor = Self::technical_factor(&inputs.technical);
        let volatility_factor = (0.15 / inputs.volatility.max(0.05)).min(2.0);
        let heat_constraint =
            ((inputs.max_heat_pct - inputs.portfolio_heat_pct) / 10.0).clamp(0.0, 1.0);

        if heat_constraint < 1.0 {
            warnings.push(format!(
                "portfolio heat {:.1}% constrains sizing",
                inputs.portfolio_heat_pct
            ));
        }

        let raw = base
            * risk_factor
            * confidence_factor
            * technical_factor
            * volatility_factor
            * heat_constraint;

        let final_percent = if raw <= 0.0 {
            0.0
        } else {
            raw.clamp(
                self.config.min_position_percent,
                self.config.max_position_percent,
            )
        };

        SizingCalculation {
            method,
            base_percent: base,
            risk_factor,
            confidence_factor,
            technical_factor,
            volatility_factor,
            heat_constraint,
            final_percent,
            warnings,
        }
    }

    fn select_method(&self, inputs: &SizingInputs) -> SizingMethod {
        let win_rate = if inputs.pnl_history.is_empty() {
            0.0
        } else {
            inputs.pnl_history.iter().filter(|p| **p > 0.0).count() as f64
                / inputs.pnl_history.len() as f64
        };

        if inputs.pnl_history.len() >= KELLY_MIN_TRADES && win_rate >= KELLY_MIN_WIN_RATE {
            SizingMethod::KellyCriterion
        } else if inputs.volatility > HIGH_VOLATILITY {
            SizingMethod::VolatilityAdjusted
        } else if inputs.portfolio_heat_pct > HEAT_METHOD_THRESHOLD {
            SizingMethod::RiskBased
        } else if inputs.confidence < LOW_CONFIDENCE {
            SizingMethod::ConfidenceWeighted
        } else {
            SizingMethod::RiskBased
        }
    }

    fn base_size(&self, method: SizingMethod, inputs: &SizingInputs) -> f64 {
        let max = self.config.max_position_percent;
        match method {
            SizingMethod::FixedPercent => max * 0.5,
            SizingMethod::RiskBased => max * (1.0 - inputs.risk_score.clamp(0.0, 1.0)),
            SizingMethod::KellyCriterion => self
                .kelly_fraction(&inputs.pnl_history)
                .map(|f| (f * KELLY_MULTIPLIER * 100.0).min(max))
                .unwrap_or(max * 0.25),
            SizingMethod::VolatilityAdjusted => {
                max * (0.15 / inputs.volatility.max(0.05)).min(1.0)
            }
            SizingMethod::ConfidenceWeighted => max * inputs.confidence.clamp(0.0, 1.0),
            SizingMethod::PortfolioHeat => {
                max * ((inputs.max_heat_pct - inputs.portfolio_heat_pct) / inputs.max_heat_pct)
                    .clamp(0.0, 1.0)
            }
        }
    }

    /// Kelly fraction f* = (b·p − q) / b from the trade history.
    fn kelly_fraction(&self, pnl_history: &[f64]) -> Option<f64> {
        if pnl_history.len() < KELLY_MIN_TRADES {
            return None;
        }
        let wins: Vec<f64> = pnl_history.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnl_history.iter().copied().filter(|p| *p < 0.0).collect();

        let win_rate = wins.len() as f64 / pnl_history.len() as f64;
        if win_rate < KELLY_MIN_WIN_RATE || losses.is_empty() {
            return None;
        }

        let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        let avg_loss = losses.iter().map(|l| l.abs()).sum::<f64>() / losses.len() as f64;
        if avg_loss <= 0.0 {
            return None;
        }

        let b = avg_win / avg_loss;
        let kelly = (b * win_rate - (1.0 - win_rate)) / b;
        (kelly > 0.0).then_some(kelly.min(1.0))
    }

    /// Technical alignment factor in [0.5, 1.5]
    fn technical_factor(summary: &TechnicalSummary) -> f64 {
        match summary.overall_signal {
            SignalDirection::Buy => 1.0 + 0.5 * summary.average_strength,
            SignalDirection::Sell => 1.0 - 0.5 * summary.average_strength,
            SignalDirection::Neutral => 1.0,
        }
        .clamp(0.5, 1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::new(SmartLaneConfig::default())
    }

    fn inputs() -> SizingInputs {
        SizingInputs {
            risk_score: 0.3,
            confidence: 0.8,
            technical: TechnicalSummary {
                overall_signal: SignalDirection::Buy,
                average_strength: 0.7,
                average_confidence: 0.8,
                buy_timeframes: 3,
                sell_timeframes: 0,
                neutral_timeframes: 0,
            },
            volatility: 0.1,
            portfolio_heat_pct: 5.0,
            max_heat_pct: 20.0,
            open_positions: 2,
            pnl_history: Vec::new(),
        }
    }

    #[test]
    fn test_size_within_bounds_or_zero() {
        let sizer = sizer();
        let calc = sizer.calculate(&inputs());
        let cfg = SmartLaneConfig::default();
        assert!(
            calc.final_percent == 0.0
                || (cfg.min_position_percent..=cfg.max_position_percent)
                    .contains(&calc.final_percent)
        );
        assert!(calc.final_percent > 0.0);
    }

    #[test]
    fn test_capacity_exhausted_zeroes_size() {
        let sizer = sizer();
        let mut i = inputs();
        i.open_positions = SmartLaneConfig::default().max_positions;
        let calc = sizer.calculate(&i);
        assert_eq!(calc.final_percent, 0.0);
        assert!(calc.warnings.iter().any(|w| w.contains("capacity")));
    }

    #[test]
    fn test_high_volatility_selects_vol_method() {
        let sizer = sizer();
        let mut i = inputs();
        i.volatility = 0.4;
        let calc = sizer.calculate(&i);
        assert_eq!(calc.method, SizingMethod::VolatilityAdjusted);
        // High volatility shrinks the factor below 1
        assert!(calc.volatility_factor < 1.0);
    }

    #[test]
    fn test_heat_selects_risk_based_and_constrains() {
        let sizer = sizer();
        let mut i = inputs();
        i.portfolio_heat_pct = 18.0;
        let calc = sizer.calculate(&i);
        assert_eq!(calc.method, SizingMethod::RiskBased);
        assert!(calc.heat_constraint < 1.0);
    }

    #[test]
    fn test_low_confidence_selects_confidence_weighted() {
        let sizer = sizer();
        let mut i = inputs();
        i.confidence = 0.3;
        let calc = sizer.calculate(&i);
        assert_eq!(calc.method, SizingMethod::ConfidenceWeighted);
    }

    #[test]
    fn test_kelly_requires_history_and_win_rate() {
        let sizer = sizer();
        let mut i = inputs();

        // 12 trades, 75% win rate
        i.pnl_history = vec![
            0.1, 0.2, 0.15, 0.1, 0.3, 0.2, 0.1, 0.25, 0.15, -0.1, -0.15, -0.05,
        ];
        let calc = sizer.calculate(&i);
        assert_eq!(calc.method, SizingMethod::KellyCriterion);

        // Same trades but a losing record falls back
        i.pnl_history = vec![
            -0.1, -0.2, -0.15, 0.1, -0.3, -0.2, 0.1, -0.25, -0.15, 0.1, 0.15, -0.05,
        ];
        let calc = sizer.calculate(&i);
        assert_ne!(calc.method, SizingMethod::KellyCriterion);
    }

    #[test]
    fn test_kelly_fraction_positive_edge() {
        let sizer = sizer();
        let history = vec![0.2; 8].into_iter().chain(vec![-0.1; 2]).collect::<Vec<_>>();
        let kelly = sizer.kelly_fraction(&history).unwrap();
        assert!(kelly > 0.0 && kelly <= 1.0);
    }

    #[test]
    fn test_risk_factor_halves_at_max_risk() {
        let sizer = sizer();
        let mut i = inputs();
        i.risk_score = 1.0;
        let calc = sizer.calculate(&i);
        assert!((calc.risk_factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_technical_factor_bounds() {
        let mut summary = TechnicalSummary::default();
        summary.overall_signal = SignalDirection::Buy;
        summary.average_strength = 1.0;
        assert_eq!(PositionSizer::technical_factor(&summary), 1.5);

        summary.overall_signal = SignalDirection::Sell;
        assert_eq!(PositionSizer::technical_factor(&summary), 0.5);
    }

    #[test]
    fn test_sell_signal_shrinks_size() {
        let sizer = sizer();
        let buy = sizer.calculate(&inputs());

        let mut i = inputs();
        i.technical.overall_signal = SignalDirection::Sell;
        let sell = sizer.calculate(&i);

        assert!(sell.final_percent < buy.final_percent);
    }
}
