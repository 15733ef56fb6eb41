//! Buy/sell/transfer tax analysis
//!
//! Estimates the buy-side tax by comparing router quotes at two probe
//! sizes against the pool's spot price (separating linear tax from
//! quadratic price impact), probes transfer restrictions directly, and
//! flags honeypot potential when the sell side cannot be exercised or the
//! implied sell tax approaches confiscation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;

use crate::chain::ChainConfig;
use crate::discovery::NewPairEvent;
use crate::error::{Error, Result};
use crate::provider::manager::CallRequest;
use crate::provider::ProviderManager;
use crate::risk::types::{
    target_token, AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore,
};

const SELECTOR_EXACT_INPUT_SINGLE: [u8; 4] = [0x41, 0x4b, 0xf3, 0x89];
const SELECTOR_SLOT0: [u8; 4] = [0x38, 0x50, 0xc7, 0xbd];
const SELECTOR_TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

const PROBE_ACCOUNT: &str = "0x0000000000000000000000000000000000000001";
const PROBE_PEER: &str = "0x0000000000000000000000000000000000000002";

/// Sell tax at or above this is treated as a honeypot in waiting
const CONFISCATORY_TAX_PCT: f64 = 99.0;

/// Restriction classes detectable from transfer reverts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Restriction {
    MaxTx,
    Cooldown,
    WhitelistOnly,
}

pub struct TaxAnalyzer {
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
    max_buy_tax_percent: Decimal,
    max_sell_tax_percent: Decimal,
}

impl TaxAnalyzer {
    pub fn new(
        chain: Arc<ChainConfig>,
        providers: Arc<ProviderManager>,
        max_buy_tax_percent: Decimal,
        max_sell_tax_percent: Decimal,
    ) -> Self {
        Self {
            chain,
            providers,
            max_buy_tax_percent,
            max_sell_tax_percent,
        }
    }

    /// Spot token-per-WETH price from the pool's `slot0`.
    async fn spot_price(&self, pair: &NewPairEvent) -> Option<f64> {
        let request = CallRequest {
            to: pair.pool_address,
            data: Some(Bytes::from(SELECTOR_SLOT0.to_vec())),
            ..Default::default()
        };
        let out = self.providers.call(&request).await.ok()?;
        if out.len() < 32 {
            return None;
        }

        let sqrt_price_x96 = U256::from_big_endian(&out[0..32]);
        let ratio = u256_to_f64(sqrt_price_x96) / 2f64.powi(96);
        // price = token1 per token0
        let price_1_per_0 = ratio * ratio;
        if price_1_per_0 <= 0.0 || !price_1_per_0.is_finite() {
            return None;
        }

        // Normalize to "token out per WETH in"
        if pair.pair_id.token0 == self.chain.weth {
            Some(price_1_per_0)
        } else if pair.pair_id.token1 == self.chain.weth {
            Some(1.0 / price_1_per_0)
        } else {
            None
        }
    }

    async fn quote_buy(&self, pair: &NewPairEvent, token: Address, amount_in: U256) -> Option<U256> {
        let params = Token::Tuple(vec![
            Token::Address(self.chain.weth),
            Token::Address(token),
            Token::Uint(U256::from(pair.pair_id.fee_tier)),
            Token::Address(PROBE_ACCOUNT.parse().ok()?),
            Token::Uint(U256::MAX),
            Token::Uint(amount_in),
            Token::Uint(U256::zero()),
            Token::Uint(U256::zero()),
        ]);
        let mut calldata = SELECTOR_EXACT_INPUT_SINGLE.to_vec();
        calldata.extend(ethers::abi::encode(&[params]));

        let request = CallRequest {
            from: Some(PROBE_ACCOUNT.parse().ok()?),
            to: self.chain.router_v3,
            value: Some(amount_in),
            data: Some(Bytes::from(calldata)),
        };
        let out = self.providers.call(&request).await.ok()?;
        (out.len() >= 32).then(|| U256::from_big_endian(&out[0..32]))
    }

    /// Effective rates at two probe sizes → zero-size extrapolated rate →
    /// tax beyond the pool fee.
    fn implied_buy_tax_pct(
        spot: f64,
        fee_tier: u32,
        small: (f64, f64),
        large: (f64, f64),
    ) -> Option<(f64, f64)> {
        let (x1, out1) = small;
        let (x2, out2) = large;
        if x1 <= 0.0 || x2 <= x1 || out1 <= 0.0 || out2 <= 0.0 || spot <= 0.0 {
            return None;
        }

        let r1 = out1 / x1;
        let r2 = out2 / x2;
        // Linear price-impact extrapolation back to size zero
        let slope = (r1 - r2) / (x2 - x1);
        let r0 = r1 + slope * x1;

        let fee_fraction = fee_tier as f64 / 1_000_000.0;
        let retained = (r0 / spot).clamp(0.0, 1.5);
        let tax = (1.0 - retained - fee_fraction).max(0.0) * 100.0;

        // Divergence between the implied tax at the two sizes signals a
        // size-dependent (dynamic) tax.
        let tax_at = |r: f64| ((1.0 - (r / spot).min(1.5) - fee_fraction).max(0.0)) * 100.0;
        let dynamic_spread = (tax_at(r1) - tax_at(r2)).abs();

        Some((tax, dynamic_spread))
    }

    async fn probe_transfer(&self, token: Address) -> (bool, Vec<Restriction>, Option<String>) {
        let mut calldata = SELECTOR_TRANSFER.to_vec();
        let peer: Address = PROBE_PEER.parse().expect("probe peer literal");
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(peer.as_bytes());
        calldata.extend_from_slice(&word);
        let mut amount = [0u8; 32];
        U256::one().to_big_endian(&mut amount);
        calldata.extend_from_slice(&amount);

        let request = CallRequest {
            from: Some(PROBE_ACCOUNT.parse().expect("probe address literal")),
            to: token,
            data: Some(Bytes::from(calldata)),
            ..Default::default()
        };

        match self.providers.call(&request).await {
            Ok(_) => (true, Vec::new(), None),
            Err(Error::Rpc(reason)) => {
                let restrictions = classify_restrictions(&reason);
                (false, restrictions, Some(reason))
            }
            Err(_) => (false, Vec::new(), None),
        }
    }

    fn tax_component(&self, tax_pct: f64, limit: Decimal) -> f64 {
        let limit = limit.to_f64().unwrap_or(5.0).max(f64::EPSILON);
        if tax_pct <= limit {
            // Inside the acceptable band taxes contribute proportionally.
            0.3 * (tax_pct / limit)
        } else {
            (0.3 + 0.7 * ((tax_pct - limit) / (25.0 - limit)).min(1.0)).min(1.0)
        }
    }
}

fn classify_restrictions(reason: &str) -> Vec<Restriction> {
    let lower = reason.to_lowercase();
    let mut out = Vec::new();
    if lower.contains("max") && (lower.contains("tx") || lower.contains("amount")) {
        out.push(Restriction::MaxTx);
    }
    if lower.contains("cooldown") || lower.contains("wait") {
        out.push(Restriction::Cooldown);
    }
    if lower.contains("whitelist") || lower.contains("not authorized") {
        out.push(Restriction::WhitelistOnly);
    }
    out
}

fn u256_to_f64(value: U256) -> f64 {
    let mut out = 0.0f64;
    for i in (0..4).rev() {
        out = out * 2f64.powi(64) + value.0[i] as f64;
    }
    out
}

#[async_trait]
impl super::RiskAnalyzer for TaxAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Tax
    }

    async fn analyze(
        &self,
        pair: &NewPairEvent,
        _ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();
        let token = target_token(pair, self.chain.weth);
        let mut warnings = Vec::new();

        let spot = self.spot_price(pair).await;

        let small_in = U256::exp10(15); // 0.001 ETH
        let large_in = U256::exp10(16); // 0.01 ETH
        let small_out = self.quote_buy(pair, token, small_in).await;
        let large_out = self.quote_buy(pair, token, large_in).await;

        let buy_tax = match (spot, small_out, large_out) {
            (Some(spot), Some(s), Some(l)) => Self::implied_buy_tax_pct(
                spot,
                pair.pair_id.fee_tier,
                (1e-3, u256_to_f64(s) / 1e18),
                (1e-2, u256_to_f64(l) / 1e18),
            ),
            _ => None,
        };

        // A transfer revert without a recognizable restriction is just the
        // probe holding no balance; only classified restrictions count.
        let (_transfer_ok, restrictions, transfer_revert) = self.probe_transfer(token).await;

        let (score, confidence, quality) = match buy_tax {
            Some((tax_pct, dynamic_spread)) => {
                let mut score = self.tax_component(tax_pct, self.max_buy_tax_percent);

                // The sell side cannot be exercised without holdings;
                // mirror the buy tax and lean on the transfer probe.
                let sell_tax_pct = tax_pct;
                score = score.max(self.tax_component(sell_tax_pct, self.max_sell_tax_percent));

                if dynamic_spread > 2.0 {
                    warnings.push(format!(
                        "dynamic tax suspected: {dynamic_spread:.1}% spread across probe sizes"
                    ));
                    score = (score + 0.2).min(1.0);
                }

                if sell_tax_pct >= CONFISCATORY_TAX_PCT {
                    warnings.push("sell tax at confiscation level".to_string());
                    score = 1.0;
                }

                if !restrictions.is_empty() {
                    warnings.push(format!("transfer restrictions: {restrictions:?}"));
                    score = (score + 0.15 * restrictions.len() as f64).min(1.0);
                }
                (score, 0.7, DataQuality::Good)
            }
            None => {
                warnings.push("tax simulation unavailable".to_string());
                (0.5, 0.3, DataQuality::Fair)
            }
        };

        let mut result = RiskCategoryScore::new(RiskCategory::Tax, score, confidence, quality)
            .with_details(json!({
                "buy_tax_pct": buy_tax.map(|(t, _)| t),
                "dynamic_spread_pct": buy_tax.map(|(_, d)| d),
                "restrictions": restrictions,
                "transfer_revert": transfer_revert,
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

    #[test]
    fn test_implied_tax_clean_pool() {
        // Spot 1000 tokens/ETH, 0.3% fee, no tax: outputs track spot
        // minus fee and impact.
        let spot = 1000.0;
        let small = (0.001, 0.001 * 997.0); // 0.3% off spot
        let large = (0.01, 0.01 * 996.0); // slightly more impact
        let (tax, dynamic) =
            TaxAnalyzer::implied_buy_tax_pct(spot, 3000, small, large).unwrap();
        assert!(tax < 0.5, "clean pool implied tax {tax}");
        assert!(dynamic < 0.5);
    }

    #[test]
    fn test_implied_tax_ten_percent() {
        let spot = 1000.0;
        // 10% tax on top of the 0.3% fee
        let small = (0.001, 0.001 * 1000.0 * 0.897);
        let large = (0.01, 0.01 * 1000.0 * 0.896);
        let (tax, _) = TaxAnalyzer::implied_buy_tax_pct(spot, 3000, small, large).unwrap();
        assert!((tax - 10.0).abs() < 1.0, "implied tax {tax}");
    }

    #[test]
    fn test_implied_tax_rejects_bad_inputs() {
        assert!(TaxAnalyzer::implied_buy_tax_pct(0.0, 3000, (1.0, 1.0), (2.0, 2.0)).is_none());
        assert!(TaxAnalyzer::implied_buy_tax_pct(10.0, 3000, (1.0, 0.0), (2.0, 2.0)).is_none());
    }

    #[test]
    fn test_restriction_classification() {
        assert_eq!(
            classify_restrictions("Transfer exceeds maxTxAmount"),
            vec![Restriction::MaxTx]
        );
        assert_eq!(
            classify_restrictions("cooldown: wait 30s between trades"),
            vec![Restriction::Cooldown]
        );
        assert_eq!(
            classify_restrictions("sender not in whitelist"),
            vec![Restriction::WhitelistOnly]
        );
        assert!(classify_restrictions("execution reverted").is_empty());
    }

    #[test]
    fn test_u256_to_f64() {
        assert_eq!(u256_to_f64(U256::zero()), 0.0);
        assert_eq!(u256_to_f64(U256::from(1u64) << 96), 2f64.powi(96));
        let wei = U256::exp10(18);
        assert!((u256_to_f64(wei) - 1e18).abs() / 1e18 < 1e-9);
    }

    #[test]
    fn test_tax_component_scales() {
        use crate::chain::ChainRegistry;
        use crate::config::ProviderConfig;
        use rust_decimal_macros::dec;

        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        let chain = Arc::new(registry.get(1).unwrap().clone());
        let providers =
            Arc::new(ProviderManager::new(Arc::clone(&chain), ProviderConfig::default()).unwrap());
        let analyzer = TaxAnalyzer::new(chain, providers, dec!(5.0), dec!(5.0));

        assert!(analyzer.tax_component(0.0, dec!(5.0)) < 0.01);
        assert!(analyzer.tax_component(3.0, dec!(5.0)) < 0.3);
        assert!(analyzer.tax_component(10.0, dec!(5.0)) > 0.4);
        assert!(analyzer.tax_component(30.0, dec!(5.0)) >= 0.99);
    }
}
