//! Smart-lane pipeline
//!
//! Orchestrates the four analysis phases under a hard deadline: parallel
//! risk assessment, technical analysis, strategy (sizing + exits) and
//! recommendation synthesis. A deadline breach yields AVOID at low
//! confidence rather than an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SmartLaneConfig;
use crate::discovery::NewPairEvent;
use crate::risk::types::{target_token, AnalysisContext};
use crate::risk::RiskEngine;

use super::exits::{ExitInputs, ExitStrategyManager, MarketRegime};
use super::sizing::{PositionSizer, SizingCalculation, SizingInputs};
use super::technical::{analyze_timeframe, summarize, SignalDirection, TechnicalSignal, TechnicalSummary};

/// Phase budget for risk analysis inside the pipeline
const RISK_PHASE_BUDGET: Duration = Duration::from_secs(3);

/// Final recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SmartLaneRecommendation {
    Buy,
    PartialBuy,
    ScaleIn,
    Hold,
    Wait,
    Sell,
    Avoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

/// Portfolio state the pipeline needs for sizing
#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    pub heat_pct: f64,
    pub max_heat_pct: f64,
    pub open_positions: usize,
    pub pnl_history: Vec<f64>,
}

/// Complete smart-lane output for one pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartLaneAnalysis {
    pub analysis_id: Uuid,
    pub chain_id: u64,
    pub token_address: Address,
    pub recommendation: SmartLaneRecommendation,
    pub confidence_level: ConfidenceLevel,
    pub position_size_percent: f64,
    pub stop_loss_percent: Option<f64>,
    pub take_profit_targets: Vec<f64>,
    pub max_hold_time_hours: Option<f64>,
    pub overall_risk_score: f64,
    pub overall_confidence: f64,
    pub technical_signals: Vec<TechnicalSignal>,
    pub technical_summary: TechnicalSummary,
    pub warnings: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
    pub total_analysis_time_ms: u64,
}

/// Hook point for the operator-facing narrative log. The engine carries a
/// no-op implementation by default; wiring a real one is external.
pub trait ThoughtLog: Send + Sync {
    fn record(&self, analysis: &SmartLaneAnalysis);
}

struct NoopThoughtLog;

impl ThoughtLog for NoopThoughtLog {
    fn record(&self, _analysis: &SmartLaneAnalysis) {}
}

/// Rolling pipeline counters, snapshotted on read
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub total_analyses: u64,
    pub completed: u64,
    pub deadline_breaches: u64,
    pub average_analysis_time_ms: f64,
}

pub struct SmartLanePipeline {
    risk_engine: Arc<RiskEngine>,
    sizer: PositionSizer,
    exits: ExitStrategyManager,
    config: SmartLaneConfig,
    weth: Address,
    capacity: Arc<Semaphore>,
    metrics: Mutex<PipelineMetrics>,
    thought_log: Arc<dyn ThoughtLog>,
}

impl SmartLanePipeline {
    pub fn new(risk_engine: Arc<RiskEngine>, weth: Address, config: SmartLaneConfig) -> Self {
        Self {
            risk_engine,
            sizer: PositionSizer::new(config.clone()),
            exits: ExitStrategyManager::new(config.clone()),
            capacity: Arc::new(Semaphore::new(config.max_concurrent_analyses)),
            metrics: Mutex::new(PipelineMetrics::default()),
            thought_log: Arc::new(NoopThoughtLog),
            weth,
            config,
        }
    }

    pub fn with_thought_log(mut self, hook: Arc<dyn ThoughtLog>) -> Self {
        self.thought_log = hook;
        self
    }

    /// Analyze one pair. Waits for pipeline capacity, then runs the four
    /// phases under the configured deadline.
    pub async fn analyze(
        &self,
        pair: &NewPairEvent,
        ctx: &AnalysisContext,
        portfolio: &PortfolioView,
    ) -> SmartLaneAnalysis {
        let _permit = self
            .capacity
            .acquire()
            .await
            .expect("pipeline semaphore never closed");

        let started = Instant::now();
        {
            let mut m = self.metrics.lock().await;
            m.total_analyses += 1;
        }

        let deadline = Duration::from_secs(self.config.pipeline_timeout_secs);
        let analysis = match timeout(deadline, self.run_phases(pair, ctx, portfolio)).await {
            Ok(analysis) => analysis,
            Err(_) => {
                warn!(
                    chain = pair.chain_id(),
                    pool = %pair.pool_address,
                    deadline_secs = deadline.as_secs(),
                    "Smart-lane deadline breached"
                );
                let mut m = self.metrics.lock().await;
                m.deadline_breaches += 1;
                drop(m);
                self.deadline_breach_analysis(pair)
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        let mut analysis = analysis;
        analysis.total_analysis_time_ms = elapsed;

        {
            let mut m = self.metrics.lock().await;
            m.completed += 1;
            let n = m.completed as f64;
            m.average_analysis_time_ms =
                (m.average_analysis_time_ms * (n - 1.0) + elapsed as f64) / n;
        }

        self.thought_log.record(&analysis);

        info!(
            chain = pair.chain_id(),
            token = %analysis.token_address,
            recommendation = ?analysis.recommendation,
            size_pct = analysis.position_size_percent,
            elapsed_ms = elapsed,
            "Smart-lane analysis complete"
        );

        analysis
    }

    async fn run_phases(
        &self,
        pair: &NewPairEvent,
        ctx: &AnalysisContext,
        portfolio: &PortfolioView,
    ) -> SmartLaneAnalysis {
        let token = target_token(pair, self.weth);
        let mut warnings = Vec::new();

        // Phase 1: risk (bounded tighter than the full engine deadline)
        let risk = self
            .risk_engine
            .assess_with_deadline(pair, ctx, RISK_PHASE_BUDGET)
            .await;
        let (risk_score, risk_confidence, blocking) = match &risk {
            Ok(a) => (a.overall_score, a.overall_confidence, !a.is_tradeable),
            Err(e) => {
                warnings.push(format!("risk assessment unavailable: {e}"));
                (1.0, 0.0, true)
            }
        };

        // Phase 2: technical
        let signals: Vec<TechnicalSignal> = self
            .config
            .technical_timeframes
            .iter()
            .map(|tf| analyze_timeframe(&ctx.price_history, *tf))
            .collect();
        let technical = summarize(&signals);

        // Phase 3: strategy
        let volatility = estimate_volatility(ctx);
        let sizing = self.sizer.calculate(&SizingInputs {
            risk_score,
            confidence: risk_confidence,
            technical: technical.clone(),
            volatility,
            portfolio_heat_pct: portfolio.heat_pct,
            max_heat_pct: portfolio.max_heat_pct.max(1.0),
            open_positions: portfolio.open_positions,
            pnl_history: portfolio.pnl_history.clone(),
        });
        warnings.extend(sizing.warnings.iter().cloned());

        let exit_strategy = self.exits.generate(&ExitInputs {
            risk_score,
            confidence: risk_confidence,
            volatility,
            market_stress: 0.0,
            regime: infer_regime(&technical),
            liquidity_score: liquidity_score(ctx),
            position_size_usd: position_value_estimate(ctx, &sizing),
        });

        // Phase 4: recommendation synthesis
        let (recommendation, confidence_level) = self.decide(
            risk_score,
            risk_confidence,
            blocking,
            &technical,
            sizing.final_percent,
        );

        debug!(
            token = %token,
            risk = risk_score,
            tech = ?technical.overall_signal,
            size = sizing.final_percent,
            "Recommendation synthesized"
        );

        SmartLaneAnalysis {
            analysis_id: Uuid::new_v4(),
            chain_id: pair.chain_id(),
            token_address: token,
            recommendation,
            confidence_level,
            position_size_percent: match recommendation {
                SmartLaneRecommendation::Avoid | SmartLaneRecommendation::Wait => 0.0,
                _ => sizing.final_percent,
            },
            stop_loss_percent: Some(exit_strategy.stop_loss_percent),
            take_profit_targets: exit_strategy
                .take_profit_levels()
                .map(|l| l.price_move_percent)
                .collect(),
            max_hold_time_hours: exit_strategy.max_hold_time_hours,
            overall_risk_score: risk_score,
            overall_confidence: risk_confidence,
            technical_signals: signals,
            technical_summary: technical,
            warnings,
            analyzed_at: Utc::now(),
            total_analysis_time_ms: 0,
        }
    }

    /// The decision matrix.
    fn decide(
        &self,
        risk: f64,
        confidence: f64,
        blocking: bool,
        technical: &TechnicalSummary,
        size_percent: f64,
    ) -> (SmartLaneRecommendation, ConfidenceLevel) {
        let max_risk = self.risk_limit();
        let strength = technical.average_strength;

        if blocking || risk > max_risk {
            let level = if confidence > 0.7 {
                ConfidenceLevel::High
            } else {
                ConfidenceLevel::Medium
            };
            return (SmartLaneRecommendation::Avoid, level);
        }

        if confidence < self.config.min_confidence_threshold {
            return (SmartLaneRecommendation::Wait, ConfidenceLevel::Low);
        }

        let graded = |c: f64| {
            if c > 0.8 {
                ConfidenceLevel::High
            } else {
                ConfidenceLevel::Medium
            }
        };

        match technical.overall_signal {
            SignalDirection::Buy if strength > 0.6 => {
                if size_percent > 5.0 {
                    (SmartLaneRecommendation::Buy, graded(confidence))
                } else {
                    (SmartLaneRecommendation::PartialBuy, graded(confidence))
                }
            }
            SignalDirection::Sell if strength > 0.6 => {
                (SmartLaneRecommendation::Sell, graded(confidence))
            }
            _ if risk <= 0.3 && strength > 0.4 => {
                (SmartLaneRecommendation::ScaleIn, ConfidenceLevel::Medium)
            }
            _ => (SmartLaneRecommendation::Hold, ConfidenceLevel::Low),
        }
    }

    fn risk_limit(&self) -> f64 {
        // The engine already applies max_acceptable_risk_score to
        // tradeability; the matrix re-checks against the same bound.
        0.8
    }

    fn deadline_breach_analysis(&self, pair: &NewPairEvent) -> SmartLaneAnalysis {
        SmartLaneAnalysis {
            analysis_id: Uuid::new_v4(),
            chain_id: pair.chain_id(),
            token_address: target_token(pair, self.weth),
            recommendation: SmartLaneRecommendation::Avoid,
            confidence_level: ConfidenceLevel::Low,
            position_size_percent: 0.0,
            stop_loss_percent: None,
            take_profit_targets: Vec::new(),
            max_hold_time_hours: None,
            overall_risk_score: 1.0,
            overall_confidence: 0.0,
            technical_signals: Vec::new(),
            technical_summary: TechnicalSummary::default(),
            warnings: vec![format!(
                "analysis deadline ({}s) breached",
                self.config.pipeline_timeout_secs
            )],
            analyzed_at: Utc::now(),
            total_analysis_time_ms: 0,
        }
    }

    pub async fn metrics(&self) -> PipelineMetrics {
        self.metrics.lock().await.clone()
    }
}

/// Stddev of log returns over the price history, scaled into [0, 1]
fn estimate_volatility(ctx: &AnalysisContext) -> f64 {
    let prices: Vec<f64> = ctx
        .price_history
        .iter()
        .map(|p| p.price)
        .filter(|p| *p > 0.0)
        .collect();
    if prices.len() < 3 {
        return 0.15; // neutral default when history is thin
    }
    let returns: Vec<f64> = prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    (var.sqrt() * 10.0).clamp(0.0, 1.0)
}

fn liquidity_score(ctx: &AnalysisContext) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    match ctx.liquidity_usd.and_then(|d| d.to_f64()) {
        Some(liq) if liq > 0.0 => (liq / 500_000.0).min(1.0),
        _ => 0.0,
    }
}

fn infer_regime(technical: &TechnicalSummary) -> MarketRegime {
    match technical.overall_signal {
        SignalDirection::Buy if technical.average_strength > 0.5 => MarketRegime::Bull,
        SignalDirection::Sell if technical.average_strength > 0.5 => MarketRegime::Bear,
        _ => MarketRegime::Sideways,
    }
}

fn position_value_estimate(
    ctx: &AnalysisContext,
    sizing: &SizingCalculation,
) -> rust_decimal::Decimal {
    use rust_decimal::prelude::FromPrimitive;
    let liquidity = ctx.liquidity_usd.unwrap_or_default();
    let fraction =
        rust_decimal::Decimal::from_f64(sizing.final_percent / 100.0).unwrap_or_default();
    liquidity * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRegistry;
    use crate::config::RiskConfig;
    use crate::risk::analyzers::RiskAnalyzer;
    use crate::risk::types::{DataQuality, RiskCategory, RiskCategoryScore};
    use crate::risk::RiskCache;
    use crate::smart_lane::technical::history_from_closes;
    use async_trait::async_trait;
    use ethers::types::H256;

    struct StubAnalyzer {
        category: RiskCategory,
        score: f64,
        confidence: f64,
    }

    #[async_trait]
    impl RiskAnalyzer for StubAnalyzer {
        fn category(&self) -> RiskCategory {
            self.category
        }
        async fn analyze(
            &self,
            _pair: &NewPairEvent,
            _ctx: &AnalysisContext,
        ) -> crate::error::Result<RiskCategoryScore> {
            Ok(RiskCategoryScore::new(
                self.category,
                self.score,
                self.confidence,
                DataQuality::Good,
            ))
        }
    }

    fn pipeline(risk_score: f64, confidence: f64) -> SmartLanePipeline {
        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        let chain = Arc::new(registry.get(1).unwrap().clone());
        let analyzers: Vec<Arc<dyn RiskAnalyzer>> = vec![
            Arc::new(StubAnalyzer {
                category: RiskCategory::Honeypot,
                score: risk_score,
                confidence,
            }),
            Arc::new(StubAnalyzer {
                category: RiskCategory::Liquidity,
                score: risk_score,
                confidence,
            }),
        ];
        let engine = Arc::new(RiskEngine::with_analyzers(
            Arc::clone(&chain),
            analyzers,
            RiskCache::new(50),
            RiskConfig::default(),
        ));
        SmartLanePipeline::new(engine, chain.weth, SmartLaneConfig::default())
    }

    fn pair() -> NewPairEvent {
        use crate::discovery::event::{PairId, TokenMeta};
        let t0 = Address::random();
        let t1 = Address::random();
        NewPairEvent {
            pair_id: PairId { chain_id: 1, token0: t0, token1: t1, fee_tier: 3000 },
            pool_address: Address::random(),
            token0: TokenMeta { address: t0, symbol: "NEW".into(), decimals: 18 },
            token1: TokenMeta { address: t1, symbol: "WETH".into(), decimals: 18 },
            tick_spacing: 60,
            block_number: 1,
            tx_hash: H256::zero(),
            discovered_at: Utc::now(),
            is_weth_pair: true,
            is_stablecoin_pair: false,
            discovery_latency_ms: 10,
        }
    }

    fn uptrend_ctx() -> AnalysisContext {
        // Long oversold base then recovery; enough depth for confidence
        let mut closes: Vec<f64> = (0..100).map(|i| 2.0 - i as f64 * 0.01).collect();
        closes.extend((0..10).map(|i| 1.0 + i as f64 * 0.001));
        AnalysisContext {
            liquidity_usd: Some(rust_decimal_macros::dec!(250000)),
            price_history: history_from_closes(&closes, 5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_high_risk_is_avoid() {
        let p = pipeline(0.95, 0.9);
        let analysis = p
            .analyze(&pair(), &uptrend_ctx(), &PortfolioView::default())
            .await;
        assert_eq!(analysis.recommendation, SmartLaneRecommendation::Avoid);
        assert_eq!(analysis.position_size_percent, 0.0);
        assert_eq!(analysis.confidence_level, ConfidenceLevel::High);
    }

    #[tokio::test]
    async fn test_low_confidence_is_wait() {
        let p = pipeline(0.2, 0.1);
        let analysis = p
            .analyze(&pair(), &uptrend_ctx(), &PortfolioView::default())
            .await;
        // Overall confidence 0.1 < min threshold 0.4
        assert_eq!(analysis.recommendation, SmartLaneRecommendation::Wait);
        assert_eq!(analysis.confidence_level, ConfidenceLevel::Low);
    }

    #[tokio::test]
    async fn test_decision_matrix_buy_paths() {
        let p = pipeline(0.1, 0.9);

        let strong_buy = TechnicalSummary {
            overall_signal: SignalDirection::Buy,
            average_strength: 0.8,
            average_confidence: 0.8,
            buy_timeframes: 3,
            sell_timeframes: 0,
            neutral_timeframes: 0,
        };
        let (rec, level) = p.decide(0.1, 0.9, false, &strong_buy, 8.0);
        assert_eq!(rec, SmartLaneRecommendation::Buy);
        assert_eq!(level, ConfidenceLevel::High);

        let (rec, _) = p.decide(0.1, 0.9, false, &strong_buy, 3.0);
        assert_eq!(rec, SmartLaneRecommendation::PartialBuy);
    }

    #[tokio::test]
    async fn test_decision_matrix_sell_scalein_hold() {
        let p = pipeline(0.1, 0.9);

        let strong_sell = TechnicalSummary {
            overall_signal: SignalDirection::Sell,
            average_strength: 0.7,
            average_confidence: 0.7,
            buy_timeframes: 0,
            sell_timeframes: 3,
            neutral_timeframes: 0,
        };
        let (rec, _) = p.decide(0.5, 0.9, false, &strong_sell, 5.0);
        assert_eq!(rec, SmartLaneRecommendation::Sell);

        let moderate = TechnicalSummary {
            overall_signal: SignalDirection::Neutral,
            average_strength: 0.5,
            average_confidence: 0.6,
            buy_timeframes: 1,
            sell_timeframes: 1,
            neutral_timeframes: 1,
        };
        let (rec, level) = p.decide(0.2, 0.9, false, &moderate, 5.0);
        assert_eq!(rec, SmartLaneRecommendation::ScaleIn);
        assert_eq!(level, ConfidenceLevel::Medium);

        let (rec, _) = p.decide(0.5, 0.9, false, &moderate, 5.0);
        assert_eq!(rec, SmartLaneRecommendation::Hold);
    }

    #[tokio::test]
    async fn test_analysis_carries_exit_plan() {
        let p = pipeline(0.2, 0.8);
        let analysis = p
            .analyze(&pair(), &uptrend_ctx(), &PortfolioView::default())
            .await;
        assert!(analysis.stop_loss_percent.is_some());
        let total: f64 = analysis.take_profit_targets.len() as f64;
        assert!(total >= 1.0);
        assert!(analysis.total_analysis_time_ms < 5_000);
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let p = pipeline(0.2, 0.8);
        p.analyze(&pair(), &uptrend_ctx(), &PortfolioView::default())
            .await;
        p.analyze(&pair(), &uptrend_ctx(), &PortfolioView::default())
            .await;
        let m = p.metrics().await;
        assert_eq!(m.total_analyses, 2);
        assert_eq!(m.completed, 2);
    }

    #[test]
    fn test_volatility_estimate_bounds() {
        let calm = AnalysisContext {
            price_history: history_from_closes(&[1.0, 1.0, 1.0, 1.0], 5),
            ..Default::default()
        };
        assert!(estimate_volatility(&calm) < 0.01);

        let wild = AnalysisContext {
            price_history: history_from_closes(&[1.0, 2.0, 0.5, 3.0, 0.2], 5),
            ..Default::default()
        };
        assert!(estimate_volatility(&wild) > 0.5);
    }
}
