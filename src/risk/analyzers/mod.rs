//! Category analyzers
//!
//! A closed set of analyzers behind one trait, registered per category at
//! construction time. Honeypot, liquidity and tax analyzers simulate
//! against the chain through the provider manager; the remaining
//! categories are pure functions of the `AnalysisContext` and degrade
//! their confidence when inputs are missing.

pub mod contract;
pub mod holder;
pub mod honeypot;
pub mod liquidity;
pub mod market;
pub mod social;
pub mod tax;
pub mod technical;

use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::ChainConfig;
use crate::config::RiskConfig;
use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::provider::ProviderManager;

use super::types::{AnalysisContext, RiskCategory, RiskCategoryScore};

/// Contract implemented by every category analyzer
#[async_trait]
pub trait RiskAnalyzer: Send + Sync {
    fn category(&self) -> RiskCategory;

    /// Produce a category score. Implementations clamp score and
    /// confidence to `[0, 1]` via `RiskCategoryScore::new` and never
    /// panic on missing context.
    async fn analyze(&self, pair: &NewPairEvent, ctx: &AnalysisContext)
        -> Result<RiskCategoryScore>;
}

/// Build the full analyzer registry for one chain.
///
/// The set is closed: every `RiskCategory` maps to exactly one analyzer,
/// and thresholds come from `RiskConfig` (the authoritative source).
pub fn build_registry(
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
    config: &RiskConfig,
) -> Vec<Arc<dyn RiskAnalyzer>> {
    RiskCategory::all()
        .into_iter()
        .map(|category| -> Arc<dyn RiskAnalyzer> {
            match category {
                RiskCategory::Honeypot => Arc::new(honeypot::HoneypotAnalyzer::new(
                    Arc::clone(&chain),
                    Arc::clone(&providers),
                )),
                RiskCategory::Liquidity => Arc::new(liquidity::LiquidityAnalyzer::new(
                    Arc::clone(&chain),
                    Arc::clone(&providers),
                    config.min_liquidity_usd,
                    config.min_locked_percent,
                )),
                RiskCategory::ContractSecurity => {
                    Arc::new(contract::ContractAnalyzer::new())
                }
                RiskCategory::Tax => Arc::new(tax::TaxAnalyzer::new(
                    Arc::clone(&chain),
                    Arc::clone(&providers),
                    config.max_buy_tax_percent,
                    config.max_sell_tax_percent,
                )),
                RiskCategory::Holder => {
                    Arc::new(holder::HolderAnalyzer::new(config.min_holder_count))
                }
                RiskCategory::Market => Arc::new(market::MarketAnalyzer::new()),
                RiskCategory::Social => Arc::new(social::SocialAnalyzer::new()),
                RiskCategory::Technical => Arc::new(technical::TechnicalAnalyzer::new()),
            }
        })
        .collect()
}

/// Gini coefficient of a share distribution; 0 = equal, 1 = concentrated.
///
/// Used by the holder and market analyzers for concentration measures.
pub fn gini(shares: &[f64]) -> f64 {
    let n = shares.len();
    if n == 0 {
        return 0.0;
    }
    let mut sorted: Vec<f64> = shares.iter().copied().filter(|v| *v >= 0.0).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let total: f64 = sorted.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }

    let n = sorted.len() as f64;
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 + 1.0) * v)
        .sum();
    ((2.0 * weighted) / (n * total) - (n + 1.0) / n).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gini_equal_distribution() {
        let shares = vec![1.0; 10];
        assert!(gini(&shares) < 0.01);
    }

    #[test]
    fn test_gini_concentrated() {
        let mut shares = vec![0.001; 99];
        shares.push(100.0);
        assert!(gini(&shares) > 0.9);
    }

    #[test]
    fn test_gini_empty() {
        assert_eq!(gini(&[]), 0.0);
        assert_eq!(gini(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_registry_covers_every_category() {
        use crate::chain::ChainRegistry;
        use crate::config::ProviderConfig;

        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        let chain = Arc::new(registry.get(1).unwrap().clone());
        let providers =
            Arc::new(ProviderManager::new(Arc::clone(&chain), ProviderConfig::default()).unwrap());

        let analyzers = build_registry(chain, providers, &RiskConfig::default());
        assert_eq!(analyzers.len(), RiskCategory::all().len());

        let mut categories: Vec<RiskCategory> =
            analyzers.iter().map(|a| a.category()).collect();
        categories.dedup();
        assert_eq!(categories.len(), RiskCategory::all().len());
    }
}
