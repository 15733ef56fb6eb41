//! Holder distribution analysis
//!
//! Concentration tiers, Gini, team and exchange allocations and
//! coordinated-dump indicators from the holder snapshot. Contributes to
//! the overall score without blocking.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::risk::types::{AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore};

use super::gini;

pub struct HolderAnalyzer {
    min_holder_count: u32,
}

impl HolderAnalyzer {
    pub fn new(min_holder_count: u32) -> Self {
        Self { min_holder_count }
    }

    /// Share of supply held by the top `k` wallets
    fn top_k_pct(holders: &[f64], k: usize) -> f64 {
        let mut sorted = holders.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        sorted.iter().take(k).sum()
    }

    /// Sell pressure from large holders inside a short window: several top
    /// holders selling together reads as a coordinated dump.
    fn dump_indicator(ctx: &AnalysisContext) -> f64 {
        if ctx.trades.is_empty() || ctx.holders.is_empty() {
            return 0.0;
        }

        let top_wallets: Vec<_> = {
            let mut sorted = ctx.holders.clone();
            sorted.sort_by(|a, b| {
                b.pct_of_supply
                    .partial_cmp(&a.pct_of_supply)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            sorted.into_iter().take(10).map(|h| h.address).collect()
        };

        let latest = match ctx.trades.iter().map(|t| t.timestamp).max() {
            Some(ts) => ts,
            None => return 0.0,
        };
        let window_start = latest - Duration::minutes(10);

        let mut sellers: HashMap<_, f64> = HashMap::new();
        for trade in &ctx.trades {
            if !trade.is_buy && trade.timestamp >= window_start && top_wallets.contains(&trade.trader)
            {
                *sellers.entry(trade.trader).or_default() += trade.amount_usd;
            }
        }

        match sellers.len() {
            0 => 0.0,
            1 => 0.2,
            2 => 0.5,
            _ => 0.9,
        }
    }
}

#[async_trait]
impl super::RiskAnalyzer for HolderAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Holder
    }

    async fn analyze(
        &self,
        _pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();
        let mut warnings = Vec::new();

        if ctx.holders.is_empty() && ctx.holder_count.is_none() {
            let mut score =
                RiskCategoryScore::new(RiskCategory::Holder, 0.5, 0.2, DataQuality::Poor)
                    .with_warning("no holder data available");
            score.analysis_time_ms = started.elapsed().as_millis() as u64;
            return Ok(score);
        }

        let shares: Vec<f64> = ctx.holders.iter().map(|h| h.pct_of_supply).collect();
        let gini_coeff = gini(&shares);
        let top10 = Self::top_k_pct(&shares, 10);
        let top1 = Self::top_k_pct(&shares, 1);
        let team_pct = ctx.team_allocation_pct.unwrap_or(0.0);
        let exchange_pct: f64 = ctx
            .holders
            .iter()
            .filter(|h| h.is_contract)
            .map(|h| h.pct_of_supply)
            .sum();
        let dump = Self::dump_indicator(ctx);

        let mut score = 0.0;

        // Concentration tiers
        if top1 > 30.0 {
            score += 0.35;
            warnings.push(format!("top holder owns {top1:.1}% of supply"));
        } else if top1 > 15.0 {
            score += 0.2;
        }
        if top10 > 70.0 {
            score += 0.25;
            warnings.push(format!("top 10 holders own {top10:.1}% of supply"));
        } else if top10 > 50.0 {
            score += 0.1;
        }

        score += 0.2 * gini_coeff;

        if team_pct > 20.0 {
            score += 0.2;
            warnings.push(format!("team allocation {team_pct:.1}%"));
        }

        if let Some(count) = ctx.holder_count {
            if count < self.min_holder_count {
                score += 0.2;
                warnings.push(format!(
                    "only {count} holders (minimum {})",
                    self.min_holder_count
                ));
            }
        }

        if dump > 0.0 {
            score += 0.3 * dump;
            if dump >= 0.5 {
                warnings.push("coordinated selling by top holders".to_string());
            }
        }

        let (confidence, quality) = if ctx.holders.len() >= 20 {
            (0.8, DataQuality::Good)
        } else if !ctx.holders.is_empty() {
            (0.5, DataQuality::Fair)
        } else {
            (0.3, DataQuality::Fair)
        };

        let mut result = RiskCategoryScore::new(
            RiskCategory::Holder,
            score.min(1.0),
            confidence,
            quality,
        )
        .with_details(json!({
            "gini": gini_coeff,
            "top1_pct": top1,
            "top10_pct": top10,
            "team_pct": team_pct,
            "exchange_pct": exchange_pct,
            "dump_indicator": dump,
            "holder_count": ctx.holder_count,
        }));
        for w in warnings {
            result = result.with_warning(w);
        }
        result.analysis_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::analyzers::RiskAnalyzer;
    use crate::risk::types::{HolderBalance, TradeRecord};
    use chrono::Utc;
    use ethers::types::Address;

    fn pair() -> NewPairEvent {
        use crate::discovery::event::{PairId, TokenMeta};
        use ethers::types::H256;
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
            discovered_at: Utc::now(),
            is_weth_pair: false,
            is_stablecoin_pair: false,
            discovery_latency_ms: 0,
        }
    }

    fn holders(shares: &[f64]) -> Vec<HolderBalance> {
        shares
            .iter()
            .map(|pct| HolderBalance {
                address: Address::random(),
                pct_of_supply: *pct,
                is_contract: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_distributed_supply_scores_low() {
        let analyzer = HolderAnalyzer::new(50);
        let ctx = AnalysisContext {
            holders: holders(&[2.0; 40]),
            holder_count: Some(500),
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score < 0.4, "score {}", score.score);
    }

    #[tokio::test]
    async fn test_whale_concentration_scores_high() {
        let analyzer = HolderAnalyzer::new(50);
        let mut h = holders(&[0.1; 20]);
        h.push(HolderBalance {
            address: Address::random(),
            pct_of_supply: 60.0,
            is_contract: false,
        });
        let ctx = AnalysisContext {
            holders: h,
            holder_count: Some(21),
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score > 0.6, "score {}", score.score);
        assert!(score.warnings.iter().any(|w| w.contains("top holder")));
    }

    #[tokio::test]
    async fn test_missing_data_is_poor_quality() {
        let analyzer = HolderAnalyzer::new(50);
        let score = analyzer
            .analyze(&pair(), &AnalysisContext::default())
            .await
            .unwrap();
        assert_eq!(score.data_quality, DataQuality::Poor);
        assert!(score.confidence <= 0.2);
        // Holder risk never blocks regardless of quality.
        assert!(!score.is_blocking_failure());
    }

    #[tokio::test]
    async fn test_coordinated_dump_detected() {
        let analyzer = HolderAnalyzer::new(50);
        let h = holders(&[10.0, 9.0, 8.0, 1.0, 1.0]);
        let now = Utc::now();
        let trades = h
            .iter()
            .take(3)
            .map(|holder| TradeRecord {
                timestamp: now,
                trader: holder.address,
                is_buy: false,
                amount_usd: 5_000.0,
            })
            .collect();
        let ctx = AnalysisContext {
            holders: h,
            holder_count: Some(100),
            trades,
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score
            .warnings
            .iter()
            .any(|w| w.contains("coordinated selling")));
    }
}
