//! Liquidity depth and LP security analysis
//!
//! Scores pool depth against the configured minimum, projected slippage at
//! standard probe sizes, and the share of LP holdings that is burned or
//! locked. A pool that fails depth outright blocks trading.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;

use crate::chain::ChainConfig;
use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::provider::manager::CallRequest;
use crate::provider::ProviderManager;
use crate::risk::types::{AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore};

/// USD probe sizes and their acceptable slippage ceilings (percent)
const SLIPPAGE_PROBES: [(f64, f64); 6] = [
    (100.0, 1.0),
    (500.0, 2.0),
    (1_000.0, 3.0),
    (5_000.0, 5.0),
    (10_000.0, 8.0),
    (50_000.0, 15.0),
];

const SELECTOR_TOTAL_SUPPLY: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];
const SELECTOR_BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

const DEAD_ADDRESS: &str = "0x000000000000000000000000000000000000dEaD";

pub struct LiquidityAnalyzer {
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
    min_liquidity_usd: Decimal,
    min_locked_percent: f64,
}

impl LiquidityAnalyzer {
    pub fn new(
        chain: Arc<ChainConfig>,
        providers: Arc<ProviderManager>,
        min_liquidity_usd: Decimal,
        min_locked_percent: f64,
    ) -> Self {
        Self {
            chain,
            providers,
            min_liquidity_usd,
            min_locked_percent,
        }
    }

    /// Depth risk: 0 at or above the minimum, rising to 1 at zero.
    fn depth_score(&self, liquidity_usd: f64) -> f64 {
        let min = self.min_liquidity_usd.to_f64().unwrap_or(10_000.0);
        if min <= 0.0 || liquidity_usd >= min {
            return 0.0;
        }
        (1.0 - liquidity_usd / min).clamp(0.0, 1.0)
    }

    /// Constant-product slippage approximation per probe; returns the
    /// fraction of probes that breach their ceiling.
    fn slippage_score(liquidity_usd: f64) -> (f64, Vec<serde_json::Value>) {
        if liquidity_usd <= 0.0 {
            return (1.0, Vec::new());
        }

        let one_side = liquidity_usd / 2.0;
        let mut breaches = 0usize;
        let mut probes = Vec::with_capacity(SLIPPAGE_PROBES.len());

        for (size, ceiling) in SLIPPAGE_PROBES {
            let slippage_pct = (size / (one_side + size)) * 100.0;
            let breach = slippage_pct > ceiling;
            if breach {
                breaches += 1;
            }
            probes.push(json!({
                "trade_usd": size,
                "slippage_pct": slippage_pct,
                "ceiling_pct": ceiling,
                "breach": breach,
            }));
        }

        (breaches as f64 / SLIPPAGE_PROBES.len() as f64, probes)
    }

    /// Lock safety per the secured/burned thresholds: fully secured pools
    /// score 0, fully unlocked pools score 1.
    fn lock_score(&self, secured_pct: f64, burned_pct: f64) -> f64 {
        if secured_pct >= self.min_locked_percent {
            return 0.0;
        }
        // A high burn share compensates for a slightly lower total.
        if burned_pct >= 50.0 && secured_pct >= 70.0 {
            return 0.1;
        }
        (1.0 - secured_pct / self.min_locked_percent).clamp(0.0, 1.0)
    }

    async fn erc20_u256(&self, token: Address, selector: [u8; 4], arg: Option<Address>) -> Option<U256> {
        let mut data = selector.to_vec();
        if let Some(addr) = arg {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(addr.as_bytes());
            data.extend_from_slice(&word);
        }
        let request = CallRequest {
            to: token,
            data: Some(Bytes::from(data)),
            ..Default::default()
        };
        let out = self.providers.call(&request).await.ok()?;
        (out.len() >= 32).then(|| U256::from_big_endian(&out[0..32]))
    }

    /// On-chain LP share fallback: burned balance of the pool token.
    /// Pools without an LP ERC-20 (V3 positions) report nothing.
    async fn fetch_lp_shares(&self, pool: Address) -> Option<(f64, f64)> {
        let total = self
            .erc20_u256(pool, SELECTOR_TOTAL_SUPPLY, None)
            .await
            .filter(|t| !t.is_zero())?;
        let zero = self
            .erc20_u256(pool, SELECTOR_BALANCE_OF, Some(Address::zero()))
            .await
            .unwrap_or_default();
        let dead = self
            .erc20_u256(pool, SELECTOR_BALANCE_OF, Some(DEAD_ADDRESS.parse().ok()?))
            .await
            .unwrap_or_default();

        let burned = zero.saturating_add(dead);
        let burned_pct = (burned.as_u128() as f64 / total.as_u128() as f64) * 100.0;
        Some((burned_pct, burned_pct))
    }
}

#[async_trait]
impl super::RiskAnalyzer for LiquidityAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Liquidity
    }

    async fn analyze(
        &self,
        pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();
        let mut warnings = Vec::new();

        let liquidity_usd = ctx.liquidity_usd.and_then(|d| d.to_f64());
        let (secured_pct, burned_pct) = match (ctx.lp_secured_pct, ctx.lp_burned_pct) {
            (Some(s), b) => (Some(s), b.or(Some(0.0))),
            (None, _) => match self.fetch_lp_shares(pair.pool_address).await {
                Some((secured, burned)) => (Some(secured), Some(burned)),
                None => (None, None),
            },
        };

        let (score, confidence, quality, details) = match liquidity_usd {
            Some(liquidity) => {
                let depth = self.depth_score(liquidity);
                let (slippage, probes) = Self::slippage_score(liquidity);

                let (lock, lock_known) = match secured_pct {
                    Some(secured) => (
                        self.lock_score(secured, burned_pct.unwrap_or(0.0)),
                        true,
                    ),
                    None => {
                        warnings.push("LP lock status unavailable".to_string());
                        (0.5, false)
                    }
                };

                if depth > 0.0 {
                    warnings.push(format!(
                        "liquidity ${liquidity:.0} below minimum ${}",
                        self.min_liquidity_usd
                    ));
                }

                let score = 0.4 * depth + 0.3 * slippage + 0.3 * lock;
                // A pool below half the minimum is blocked outright, not
                // merely penalized.
                let score = if liquidity
                    < self.min_liquidity_usd.to_f64().unwrap_or(10_000.0) / 2.0
                {
                    score.max(0.85)
                } else {
                    score
                };

                let confidence = if lock_known { 0.9 } else { 0.6 };
                let quality = if lock_known {
                    DataQuality::Good
                } else {
                    DataQuality::Fair
                };

                (
                    score,
                    confidence,
                    quality,
                    json!({
                        "liquidity_usd": liquidity,
                        "depth_score": depth,
                        "slippage_probes": probes,
                        "lp_secured_pct": secured_pct,
                        "lp_burned_pct": burned_pct,
                    }),
                )
            }
            None => {
                warnings.push("liquidity unknown; treating as empty pool".to_string());
                (1.0, 0.0, DataQuality::Poor, serde_json::Value::Null)
            }
        };

        let mut result =
            RiskCategoryScore::new(RiskCategory::Liquidity, score, confidence, quality)
                .with_details(details);
        for w in warnings {
            result = result.with_warning(w);
        }
        result.analysis_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}
