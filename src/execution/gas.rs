//! Gas planning
//!
//! EIP-1559 fee construction by urgency tier, capped at the configured
//! ceiling, with a safety margin over the node's gas estimate.

use std::sync::Arc;

use ethers::types::U256;

use crate::error::{Error, Result};
use crate::provider::manager::CallRequest;
use crate::provider::ProviderManager;

use super::types::TradePriority;

/// Estimate is padded by 20% before use as the limit
const GAS_LIMIT_MARGIN_PCT: u64 = 20;

/// Priority fee per urgency tier, in gwei
fn priority_fee_gwei(priority: TradePriority) -> u64 {
    match priority {
        TradePriority::Standard => 1,
        TradePriority::High => 2,
        TradePriority::Urgent => 4,
    }
}

/// A complete fee plan for one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasPlan {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub gas_limit: U256,
}

impl GasPlan {
    /// Bump both fees for a replacement transaction: +12.5% per attempt,
    /// which clears the 10% minimum replacement increment with margin.
    pub fn bumped(&self, attempt: u32) -> GasPlan {
        let bump = |fee: U256| {
            let mut out = fee;
            for _ in 0..attempt {
                out = out + out / 8; // ×1.125, integer-exact
            }
            out
        };
        GasPlan {
            max_fee_per_gas: bump(self.max_fee_per_gas),
            max_priority_fee_per_gas: bump(self.max_priority_fee_per_gas),
            gas_limit: self.gas_limit,
        }
    }

    /// One-shot bump used when a bundle expires and the transaction is
    /// re-routed to the public mempool.
    pub fn bumped_percent(&self, percent: u64) -> GasPlan {
        let bump = |fee: U256| fee + fee * U256::from(percent) / U256::from(100u64);
        GasPlan {
            max_fee_per_gas: bump(self.max_fee_per_gas),
            max_priority_fee_per_gas: bump(self.max_priority_fee_per_gas),
            gas_limit: self.gas_limit,
        }
    }
}

pub struct GasOptimizer {
    providers: Arc<ProviderManager>,
    max_gas_price_gwei: u64,
}

impl GasOptimizer {
    pub fn new(providers: Arc<ProviderManager>, max_gas_price_gwei: u64) -> Self {
        Self {
            providers,
            max_gas_price_gwei,
        }
    }

    /// Build a fee plan for the given call at the given urgency.
    pub async fn plan(&self, request: &CallRequest, priority: TradePriority) -> Result<GasPlan> {
        let base_fee = self.providers.gas_price().await?;
        let estimate = self.providers.estimate_gas(request).await?;

        Ok(self.plan_from(base_fee, estimate, priority))
    }

    /// Pure fee computation, split out for testing.
    pub fn plan_from(&self, base_fee: U256, estimate: U256, priority: TradePriority) -> GasPlan {
        let gwei = U256::exp10(9);
        let tip = U256::from(priority_fee_gwei(priority)) * gwei;

        // Base fee headroom for inclusion across a couple of blocks
        let max_fee: U256 = base_fee * 2 + tip;
        let ceiling = U256::from(self.max_gas_price_gwei) * gwei;
        let max_fee = max_fee.min(ceiling);
        let tip = tip.min(max_fee);

        let gas_limit = estimate + estimate * U256::from(GAS_LIMIT_MARGIN_PCT) / 100;

        GasPlan {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: tip,
            gas_limit,
        }
    }

    /// Reject plans whose ceiling-capped fee still cannot cover the
    /// current base fee.
    pub fn validate(&self, plan: &GasPlan, base_fee: U256) -> Result<()> {
        if plan.max_fee_per_gas < base_fee {
            return Err(Error::TransactionBuild(format!(
                "gas ceiling {} gwei below current base fee",
                self.max_gas_price_gwei
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRegistry;
    use crate::config::ProviderConfig;

    fn optimizer(cap_gwei: u64) -> GasOptimizer {
        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        let chain = Arc::new(registry.get(1).unwrap().clone());
        let providers =
            Arc::new(ProviderManager::new(chain, ProviderConfig::default()).unwrap());
        GasOptimizer::new(providers, cap_gwei)
    }

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_priority_tiers_increase() {
        let o = optimizer(300);
        let base = gwei(20);
        let est = U256::from(100_000u64);

        let standard = o.plan_from(base, est, TradePriority::Standard);
        let urgent = o.plan_from(base, est, TradePriority::Urgent);
        assert!(urgent.max_priority_fee_per_gas > standard.max_priority_fee_per_gas);
        assert!(urgent.max_fee_per_gas > standard.max_fee_per_gas);
    }

    #[test]
    fn test_ceiling_caps_fee() {
        let o = optimizer(30);
        let plan = o.plan_from(gwei(100), U256::from(100_000u64), TradePriority::Urgent);
        assert_eq!(plan.max_fee_per_gas, gwei(30));
    }

    #[test]
    fn test_gas_limit_margin() {
        let o = optimizer(300);
        let plan = o.plan_from(gwei(10), U256::from(100_000u64), TradePriority::Standard);
        assert_eq!(plan.gas_limit, U256::from(120_000u64));
    }

    #[test]
    fn test_replacement_bump_clears_ten_percent() {
        let plan = GasPlan {
            max_fee_per_gas: gwei(40),
            max_priority_fee_per_gas: gwei(2),
            gas_limit: U256::from(100_000u64),
        };
        let bumped = plan.bumped(1);
        // +12.5%
        assert_eq!(bumped.max_fee_per_gas, gwei(45));
        let twice = plan.bumped(2);
        assert!(twice.max_fee_per_gas > bumped.max_fee_per_gas);
        // Replacement must exceed the 10% minimum increment.
        assert!(bumped.max_fee_per_gas * 100 >= plan.max_fee_per_gas * 110);
    }

    #[test]
    fn test_one_shot_percent_bump() {
        let plan = GasPlan {
            max_fee_per_gas: gwei(40),
            max_priority_fee_per_gas: gwei(2),
            gas_limit: U256::from(100_000u64),
        };
        let bumped = plan.bumped_percent(15);
        assert_eq!(bumped.max_fee_per_gas, gwei(46));
    }

    #[test]
    fn test_validate_rejects_starved_ceiling() {
        let o = optimizer(10);
        let plan = o.plan_from(gwei(100), U256::from(100_000u64), TradePriority::Standard);
        assert!(o.validate(&plan, gwei(100)).is_err());
    }
}
