//! Social sentiment aggregation
//!
//! Aggregates external sentiment samples into a contributing score.
//! Lowest-weighted category; never blocks.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::risk::types::{AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore};

pub struct SocialAnalyzer;

impl SocialAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Volume-weighted mean polarity in [-1, 1]
    fn weighted_polarity(ctx: &AnalysisContext) -> Option<f64> {
        let total: f64 = ctx.sentiment.iter().map(|s| s.volume as f64).sum();
        if total <= 0.0 {
            return None;
        }
        let weighted: f64 = ctx
            .sentiment
            .iter()
            .map(|s| s.polarity.clamp(-1.0, 1.0) * s.volume as f64)
            .sum();
        Some(weighted / total)
    }
}

impl Default for SocialAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::RiskAnalyzer for SocialAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Social
    }

    async fn analyze(
        &self,
        _pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();

        let mut result = match Self::weighted_polarity(ctx) {
            Some(polarity) => {
                // Bearish consensus maps toward 1, bullish toward 0.
                let score = (1.0 - polarity) / 2.0;
                let sample_volume: u32 = ctx.sentiment.iter().map(|s| s.volume).sum();
                let confidence = match sample_volume {
                    0..=9 => 0.3,
                    10..=99 => 0.5,
                    _ => 0.7,
                };
                let quality = if ctx.sentiment.len() >= 2 {
                    DataQuality::Good
                } else {
                    DataQuality::Fair
                };
                RiskCategoryScore::new(RiskCategory::Social, score, confidence, quality)
                    .with_details(json!({
                        "polarity": polarity,
                        "sources": ctx.sentiment.len(),
                        "sample_volume": sample_volume,
                    }))
            }
            None => RiskCategoryScore::new(RiskCategory::Social, 0.5, 0.1, DataQuality::Poor)
                .with_warning("no sentiment data available"),
        };

        result.analysis_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::analyzers::RiskAnalyzer;
    use crate::risk::types::SentimentSample;
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
    async fn test_bullish_sentiment_scores_low() {
        let analyzer = SocialAnalyzer::new();
        let ctx = AnalysisContext {
            sentiment: vec![
                SentimentSample { source: "feed-a".into(), polarity: 0.8, volume: 200 },
                SentimentSample { source: "feed-b".into(), polarity: 0.6, volume: 100 },
            ],
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score < 0.2);
        assert!(score.confidence >= 0.7);
    }

    #[tokio::test]
    async fn test_bearish_sentiment_scores_high() {
        let analyzer = SocialAnalyzer::new();
        let ctx = AnalysisContext {
            sentiment: vec![SentimentSample {
                source: "feed".into(),
                polarity: -0.9,
                volume: 500,
            }],
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score > 0.8);
        // Social never blocks, even at maximum score.
        assert!(!score.is_blocking_failure());
    }

    #[tokio::test]
    async fn test_missing_sentiment_is_neutral_poor() {
        let analyzer = SocialAnalyzer::new();
        let score = analyzer
            .analyze(&pair(), &AnalysisContext::default())
            .await
            .unwrap();
        assert_eq!(score.score, 0.5);
        assert_eq!(score.data_quality, DataQuality::Poor);
    }
}
