//! Honeypot detection
//!
//! Simulates a buy followed by a sell on the V3 router. A token that
//! accepts the buy but reverts the sell, or whose sell revert matches the
//! suspicion list, is a honeypot and always blocks trading.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use lazy_static::lazy_static;
use regex::RegexSet;
use serde_json::json;
use tracing::warn;

use crate::chain::ChainConfig;
use crate::discovery::NewPairEvent;
use crate::error::{Error, Result};
use crate::execution::router::encode_exact_input_single;
use crate::provider::manager::CallRequest;
use crate::provider::ProviderManager;
use crate::risk::types::{
    target_token, AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore,
};

/// Probe account used for simulations
const PROBE_ACCOUNT: &str = "0x0000000000000000000000000000000000000001";

/// Buy probe: 0.001 ETH
fn probe_amount_wei() -> U256 {
    U256::exp10(15)
}

lazy_static! {
    /// Sell-side revert reasons that indicate a trap rather than a
    /// plain failure
    static ref SELL_SUSPICION: RegexSet = RegexSet::new([
        r"(?i)transfer",
        r"(?i)allowance",
        r"(?i)overflow",
        r"(?i)blacklist",
        r"(?i)not.?allowed",
        r"(?i)cooldown",
        r"(?i)max.?tx",
    ])
    .expect("valid suspicion patterns");

    /// Reverts explained by the probe account simply holding nothing;
    /// these make the sell leg inconclusive, not malicious
    static ref NO_BALANCE: RegexSet = RegexSet::new([
        r"(?i)insufficient",
        r"(?i)\bSTF\b",
        r"(?i)exceeds balance",
    ])
    .expect("valid balance patterns");
}

#[derive(Debug, Clone, PartialEq)]
enum LegOutcome {
    Success,
    Reverted(String),
}

pub struct HoneypotAnalyzer {
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
}

impl HoneypotAnalyzer {
    pub fn new(chain: Arc<ChainConfig>, providers: Arc<ProviderManager>) -> Self {
        Self { chain, providers }
    }

    fn swap_calldata(&self, token_in: Address, token_out: Address, fee: u32, amount_in: U256) -> Bytes {
        encode_exact_input_single(
            token_in,
            token_out,
            fee,
            PROBE_ACCOUNT.parse().expect("probe address literal"),
            U256::MAX,
            amount_in,
            U256::zero(),
        )
    }

    async fn simulate_leg(
        &self,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: U256,
        with_value: bool,
    ) -> Result<LegOutcome> {
        let request = CallRequest {
            from: Some(PROBE_ACCOUNT.parse().expect("probe address literal")),
            to: self.chain.router_v3,
            value: with_value.then_some(amount_in),
            data: Some(self.swap_calldata(token_in, token_out, fee, amount_in)),
        };

        match self.providers.call(&request).await {
            Ok(_) => Ok(LegOutcome::Success),
            Err(Error::Rpc(message)) => Ok(LegOutcome::Reverted(message)),
            Err(other) => Err(other),
        }
    }

    fn classify(buy: &LegOutcome, sell: &LegOutcome) -> (bool, f64, Vec<String>) {
        let mut warnings = Vec::new();

        match (buy, sell) {
            (LegOutcome::Success, LegOutcome::Success) => (false, 0.9, warnings),
            (LegOutcome::Success, LegOutcome::Reverted(reason)) => {
                if NO_BALANCE.is_match(reason) {
                    // Probe holds no tokens, so the sell leg proves nothing.
                    warnings.push(format!("sell simulation inconclusive: {reason}"));
                    (false, 0.5, warnings)
                } else if SELL_SUSPICION.is_match(reason) {
                    warnings.push(format!("sell reverted with suspicious reason: {reason}"));
                    (true, 0.95, warnings)
                } else {
                    // Buy works, sell fails for an unexplained reason.
                    warnings.push(format!("sell reverted: {reason}"));
                    (true, 0.8, warnings)
                }
            }
            (LegOutcome::Reverted(reason), _) => {
                // An untradeable token is not a honeypot, but nothing can
                // be concluded either.
                warnings.push(format!("buy simulation reverted: {reason}"));
                (false, 0.3, warnings)
            }
        }
    }
}

#[async_trait]
impl super::RiskAnalyzer for HoneypotAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::Honeypot
    }

    async fn analyze(
        &self,
        pair: &NewPairEvent,
        _ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();
        let token = target_token(pair, self.chain.weth);
        let fee = pair.pair_id.fee_tier;
        let amount = probe_amount_wei();

        let buy = self
            .simulate_leg(self.chain.weth, token, fee, amount, true)
            .await?;
        let sell = self
            .simulate_leg(token, self.chain.weth, fee, amount, false)
            .await?;

        let (is_honeypot, confidence, warnings) = Self::classify(&buy, &sell);

        if is_honeypot {
            warn!(
                chain = self.chain.chain_id,
                token = %token,
                "Honeypot detected"
            );
        }

        let quality = if confidence >= 0.8 {
            DataQuality::Good
        } else {
            DataQuality::Fair
        };

        let mut score = RiskCategoryScore::new(
            RiskCategory::Honeypot,
            if is_honeypot { 1.0 } else { 0.0 },
            confidence,
            quality,
        )
        .with_details(json!({
            "buy_success": buy == LegOutcome::Success,
            "sell_success": sell == LegOutcome::Success,
            "honeypot_detected": is_honeypot,
        }));
        for w in warnings {
            score = score.with_warning(w);
        }
        score.analysis_time_ms = started.elapsed().as_millis() as u64;
        Ok(score)
    }
}
