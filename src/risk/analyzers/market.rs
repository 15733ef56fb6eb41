//! Market structure analysis
//!
//! Volume concentration, wash-trading, pump/dump shape, coordinated
//! activity and whale impact, computed from the observed trade tape and
//! price history. Contributes to the overall score without blocking.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Duration;
use ethers::types::Address;
use serde_json::json;

use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::risk::types::{
    AnalysisContext, DataQuality, PricePoint, RiskCategory, RiskCategoryScore, TradeRecord,
};

use super::gini;

pub struct MarketAnalyzer;

impl MarketAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Volume Gini across traders
    fn volume_concentration(trades: &[TradeRecord]) -> f64 {
        let mut per_trader: HashMap<Address, f64> = HashMap::new();
        for t in trades {
            *per_trader.entry(t.trader).or_default() += t.amount_usd;
        }
        let volumes: Vec<f64> = per_trader.values().copied().collect();
        gini(&volumes)
    }

    /// Round-trip ratio: volume from traders that both bought and sold,
    /// over total volume.
    fn wash_trading_score(trades: &[TradeRecord]) -> f64 {
        let total: f64 = trades.iter().map(|t| t.amount_usd).sum();
        if total <= 0.0 {
            return 0.0;
        }

        let mut buys: HashMap<Address, f64> = HashMap::new();
        let mut sells: HashMap<Address, f64> = HashMap::new();
        for t in trades {
            if t.is_buy {
                *buys.entry(t.trader).or_default() += t.amount_usd;
            } else {
                *sells.entry(t.trader).or_default() += t.amount_usd;
            }
        }

        let round_trip: f64 = buys
            .iter()
            .filter_map(|(trader, bought)| {
                sells.get(trader).map(|sold| bought.min(*sold) * 2.0)
            })
            .sum();

        (round_trip / total).clamp(0.0, 1.0)
    }

    /// Pump-and-dump shape: a sharp run-up followed by a collapse from
    /// the peak within the observed history.
    fn pump_dump_score(history: &[PricePoint]) -> f64 {
        if history.len() < 4 {
            return 0.0;
        }
        let first = history.first().unwrap().price;
        let peak = history.iter().map(|p| p.price).fold(f64::MIN, f64::max);
        let last = history.last().unwrap().price;
        if first <= 0.0 || peak <= 0.0 {
            return 0.0;
        }

        let run_up = peak / first;
        let collapse = 1.0 - last / peak;

        if run_up > 3.0 && collapse > 0.5 {
            0.9
        } else if run_up > 2.0 && collapse > 0.3 {
            0.6
        } else if run_up > 1.5 && collapse > 0.2 {
            0.3
        } else {
            0.0
        }
    }

    /// Bursts of many distinct traders inside tight windows
    fn coordination_score(trades: &[TradeRecord]) -> f64 {
        if trades.len() < 6 {
            return 0.0;
        }
        let mut sorted: Vec<_> = trades.iter().collect();
        sorted.sort_by_key(|t| t.timestamp);

        let window = Duration::seconds(10);
        let mut max_burst = 0usize;
        for (i, anchor) in sorted.iter().enumerate() {
            let burst = sorted[i..]
                .iter()
                .take_while(|t| t.timestamp - anchor.timestamp <= window)
                .map(|t| t.trader)
                .collect::<std::collections::HashSet<_>>()
                .len();
            max_burst = max_burst.max(burst);
        }

        match max_burst {
            0..=3 => 0.0,
            4..=6 => 0.3,
            7..=10 => 0.6,
            _ => 0.9,
        }
    }

    /// Largest single trade's share of total volume
    fn whale_impact(trades: &[TradeRecord]) -> f64 {
        let total: f64 = trades.iter().map(|t| t.amount_usd).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let largest = trades.iter().map(|t| t.amount_usd).fold(0.0, f64::max);
        (largest / total).clamp(0.0, 1.0)
    }
}

impl Default for MarketAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::RiskAnalyzer for MarketAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Market
    }

    async fn analyze(
        &self,
        _pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();

        if ctx.trades.is_empty() && ctx.price_history.is_empty() {
            let mut score =
                RiskCategoryScore::new(RiskCategory::Market, 0.5, 0.2, DataQuality::Poor)
                    .with_warning("no market data available");
            score.analysis_time_ms = started.elapsed().as_millis() as u64;
            return Ok(score);
        }

        let concentration = Self::volume_concentration(&ctx.trades);
        let wash = Self::wash_trading_score(&ctx.trades);
        let pump_dump = Self::pump_dump_score(&ctx.price_history);
        let coordination = Self::coordination_score(&ctx.trades);
        let whale = Self::whale_impact(&ctx.trades);

        let score = (0.2 * concentration
            + 0.3 * wash
            + 0.25 * pump_dump
            + 0.15 * coordination
            + 0.1 * whale)
            .min(1.0);

        let mut warnings = Vec::new();
        if wash > 0.5 {
            warnings.push(format!("wash trading suspected ({:.0}% round-trip volume)", wash * 100.0));
        }
        if pump_dump > 0.5 {
            warnings.push("pump-and-dump price shape".to_string());
        }
        if coordination > 0.5 {
            warnings.push("coordinated trading bursts".to_string());
        }

        let (confidence, quality) = if ctx.trades.len() >= 30 {
            (0.8, DataQuality::Good)
        } else if ctx.trades.len() >= 10 {
            (0.6, DataQuality::Fair)
        } else {
            (0.4, DataQuality::Fair)
        };

        let mut result = RiskCategoryScore::new(RiskCategory::Market, score, confidence, quality)
            .with_details(json!({
                "volume_gini": concentration,
                "wash_trading": wash,
                "pump_dump": pump_dump,
                "coordination": coordination,
                "whale_impact": whale,
                "trades_observed": ctx.trades.len(),
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
    use chrono::Utc;

    fn trade(trader: Address, is_buy: bool, usd: f64, secs_ago: i64) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now() - Duration::seconds(secs_ago),
            trader,
            is_buy,
            amount_usd: usd,
        }
    }

    #[test]
    fn test_wash_trading_round_trips() {
        let washer = Address::random();
        let trades = vec![
            trade(washer, true, 1_000.0, 60),
            trade(washer, false, 1_000.0, 30),
        ];
        assert!(MarketAnalyzer::wash_trading_score(&trades) > 0.9);

        let organic = vec![
            trade(Address::random(), true, 1_000.0, 60),
            trade(Address::random(), false, 1_000.0, 30),
        ];
        assert_eq!(MarketAnalyzer::wash_trading_score(&organic), 0.0);
    }

    #[test]
    fn test_pump_dump_shape() {
        let now = Utc::now();
        let mk = |price: f64, min_ago: i64| PricePoint {
            timestamp: now - Duration::minutes(min_ago),
            price,
            volume_usd: 1_000.0,
        };
        // 5x run-up then 80% collapse
        let dumped = vec![mk(1.0, 60), mk(3.0, 40), mk(5.0, 20), mk(1.0, 0)];
        assert!(MarketAnalyzer::pump_dump_score(&dumped) > 0.8);

        let steady = vec![mk(1.0, 60), mk(1.05, 40), mk(1.1, 20), mk(1.08, 0)];
        assert_eq!(MarketAnalyzer::pump_dump_score(&steady), 0.0);
    }

    #[test]
    fn test_coordination_bursts() {
        let mut trades = Vec::new();
        for _ in 0..12 {
            trades.push(trade(Address::random(), true, 100.0, 1));
        }
        assert!(MarketAnalyzer::coordination_score(&trades) > 0.5);

        let spread: Vec<_> = (0..12)
            .map(|i| trade(Address::random(), true, 100.0, i * 300))
            .collect();
        assert_eq!(MarketAnalyzer::coordination_score(&spread), 0.0);
    }

    #[test]
    fn test_whale_impact() {
        let trades = vec![
            trade(Address::random(), true, 9_000.0, 10),
            trade(Address::random(), true, 500.0, 9),
            trade(Address::random(), true, 500.0, 8),
        ];
        assert!(MarketAnalyzer::whale_impact(&trades) > 0.8);
    }

    #[tokio::test]
    async fn test_empty_context_is_poor() {
        use crate::risk::analyzers::RiskAnalyzer;
        use crate::discovery::event::{PairId, TokenMeta};
        use ethers::types::H256;

        let t0 = Address::random();
        let t1 = Address::random();
        let pair = NewPairEvent {
            pair_id: PairId { chain_id: 1, token0: t0, token1: t1, fee_tier: 500 },
            pool_address: Address::random(),
            token0: TokenMeta { address: t0, symbol: "A".into(), decimals: 18 },
            token1: TokenMeta { address: t1, symbol: "B".into(), decimals: 18 },
            tick_spacing: 10,
            block_number: 1,
            tx_hash: H256::zero(),
            discovered_at: Utc::now(),
            is_weth_pair: false,
            is_stablecoin_pair: false,
            discovery_latency_ms: 0,
        };

        let analyzer = MarketAnalyzer::new();
        let score = analyzer
            .analyze(&pair, &AnalysisContext::default())
            .await
            .unwrap();
        assert_eq!(score.data_quality, DataQuality::Poor);
    }
}
