//! Technical convergence analysis
//!
//! Runs the indicator battery across the standard timeframes and scores
//! how bearish the convergence is. Contributes to the overall risk score
//! at the smallest weight and never blocks.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::risk::types::{AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore};
use crate::smart_lane::technical::{analyze_timeframe, summarize, SignalDirection};

const TIMEFRAMES: [u32; 3] = [5, 15, 60];

pub struct TechnicalAnalyzer;

impl TechnicalAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TechnicalAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::RiskAnalyzer for TechnicalAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Technical
    }

    async fn analyze(
        &self,
        _pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();

        if ctx.price_history.len() < 10 {
            let mut score =
                RiskCategoryScore::new(RiskCategory::Technical, 0.5, 0.2, DataQuality::Poor)
                    .with_warning("insufficient price history for indicators");
            score.analysis_time_ms = started.elapsed().as_millis() as u64;
            return Ok(score);
        }

        let signals: Vec<_> = TIMEFRAMES
            .iter()
            .map(|tf| analyze_timeframe(&ctx.price_history, *tf))
            .collect();
        let summary = summarize(&signals);

        // Bearish convergence maps toward 1, bullish toward 0.
        let score = match summary.overall_signal {
            SignalDirection::Sell => 0.5 + 0.5 * summary.average_strength,
            SignalDirection::Buy => 0.5 - 0.5 * summary.average_strength,
            SignalDirection::Neutral => 0.5,
        };

        let quality = if ctx.price_history.len() >= 100 {
            DataQuality::Good
        } else {
            DataQuality::Fair
        };

        let mut result = RiskCategoryScore::new(
            RiskCategory::Technical,
            score,
            summary.average_confidence,
            quality,
        )
        .with_details(json!({
            "overall_signal": summary.overall_signal,
            "average_strength": summary.average_strength,
            "buy_timeframes": summary.buy_timeframes,
            "sell_timeframes": summary.sell_timeframes,
        }));
        result.analysis_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::analyzers::RiskAnalyzer;
    use crate::smart_lane::technical::history_from_closes;
    use ethers::types::{Address, H256};

    fn pair() -> NewPairEvent {
        use crate::discovery::event::{PairId, TokenMeta};
        let t0 = Address::random();
        let t1 = Address::random();
        NewPairEvent {
            pair_id: PairId { chain_id: 1, token0: t0, token1: t1, fee_tier: 3000 },
            pool_address: Address::random(),
            token0: TokenMeta { address: t0, symbol: "A".into(), decimals: 18 },
            token1: TokenMeta { address: t1, symbol: "B".into(), decimals: 18 },
            tick_spacing: 60,
            block_number: 1,
            tx_hash: H256::zero(),
            discovered_at: chrono::Utc::now(),
            is_weth_pair: false,
            is_stablecoin_pair: false,
            discovery_latency_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_short_history_is_poor() {
        let analyzer = TechnicalAnalyzer::new();
        let score = analyzer
            .analyze(&pair(), &AnalysisContext::default())
            .await
            .unwrap();
        assert_eq!(score.data_quality, DataQuality::Poor);
        assert!(!score.is_blocking_failure());
    }

    #[tokio::test]
    async fn test_score_stays_in_bounds() {
        let analyzer = TechnicalAnalyzer::new();
        let closes: Vec<f64> = (0..120).map(|i| 1.0 + (i as f64 * 0.01)).collect();
        let ctx = AnalysisContext {
            price_history: history_from_closes(&closes, 5),
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!((0.0..=1.0).contains(&score.score));
        assert!((0.0..=1.0).contains(&score.confidence));
    }
}
