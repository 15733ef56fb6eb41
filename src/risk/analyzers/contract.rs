//! Contract security analysis
//!
//! Static scan over verified source for the classic danger patterns.
//! Tokens with no verified source are reported as UNVERIFIED_CONTRACT at
//! high risk; this category blocks.

use std::time::Instant;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::risk::types::{AnalysisContext, DataQuality, RiskCategory, RiskCategoryScore};

/// One matched finding with its weight toward the category score
#[derive(Debug, Clone, serde::Serialize)]
pub struct Finding {
    pub kind: &'static str,
    pub weight: f64,
    pub occurrences: usize,
}

struct Pattern {
    kind: &'static str,
    regex: Regex,
    weight: f64,
}

lazy_static! {
    static ref PATTERNS: Vec<Pattern> = vec![
        Pattern {
            kind: "reentrancy_call_value",
            regex: Regex::new(r"\.call\.value\s*\(").unwrap(),
            weight: 0.35,
        },
        Pattern {
            kind: "tx_origin_auth",
            regex: Regex::new(r"\btx\.origin\b").unwrap(),
            weight: 0.25,
        },
        Pattern {
            kind: "deprecated_suicide",
            regex: Regex::new(r"\b(suicide|selfdestruct)\s*\(").unwrap(),
            weight: 0.25,
        },
        Pattern {
            kind: "deprecated_throw",
            regex: Regex::new(r"\bthrow\s*;").unwrap(),
            weight: 0.10,
        },
        Pattern {
            kind: "unchecked_external_call",
            // .call(...) / .send(...) whose result is discarded on its own line
            regex: Regex::new(r"(?m)^\s*[A-Za-z_][\w\.\[\]]*\.(call|send)\s*[({]").unwrap(),
            weight: 0.20,
        },
        Pattern {
            kind: "delegatecall",
            regex: Regex::new(r"\.delegatecall\s*\(").unwrap(),
            weight: 0.20,
        },
    ];

    /// Owner-only state-changing surface; a large count means the deployer
    /// retains broad control
    static ref ADMIN_SURFACE: Regex =
        Regex::new(r"(?m)function\s+\w+\s*\([^)]*\)\s+[^{]*\bonlyOwner\b").unwrap();
}

pub struct ContractAnalyzer;

impl ContractAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn scan(source: &str) -> (Vec<Finding>, usize) {
        let findings = PATTERNS
            .iter()
            .filter_map(|p| {
                let occurrences = p.regex.find_iter(source).count();
                (occurrences > 0).then_some(Finding {
                    kind: p.kind,
                    weight: p.weight,
                    occurrences,
                })
            })
            .collect();
        let admin_fns = ADMIN_SURFACE.find_iter(source).count();
        (findings, admin_fns)
    }

    fn score_findings(findings: &[Finding], admin_fns: usize) -> f64 {
        let mut score: f64 = findings.iter().map(|f| f.weight).sum();
        // More than a handful of owner-only functions is an admin-surface
        // risk on its own.
        if admin_fns > 5 {
            score += 0.2;
        } else if admin_fns > 2 {
            score += 0.1;
        }
        score.min(1.0)
    }
}

impl Default for ContractAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::RiskAnalyzer for ContractAnalyzer {
    fn category(&self) -> RiskCategory {
        RiskCategory::ContractSecurity
    }

    async fn analyze(
        &self,
        _pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskCategoryScore> {
        let started = Instant::now();

        let result = match &ctx.contract {
            Some(contract) if contract.verified => match &contract.source {
                Some(source) => {
                    let (findings, admin_fns) = Self::scan(source);
                    let score = Self::score_findings(&findings, admin_fns);
                    let mut out = RiskCategoryScore::new(
                        RiskCategory::ContractSecurity,
                        score,
                        0.85,
                        DataQuality::Good,
                    )
                    .with_details(json!({
                        "findings": findings,
                        "only_owner_functions": admin_fns,
                        "verified": true,
                    }));
                    for f in &findings {
                        out = out.with_warning(format!(
                            "{} ({} occurrence(s))",
                            f.kind, f.occurrences
                        ));
                    }
                    out
                }
                None => RiskCategoryScore::new(
                    RiskCategory::ContractSecurity,
                    0.5,
                    0.4,
                    DataQuality::Fair,
                )
                .with_warning("source marked verified but not supplied"),
            },
            Some(_) => RiskCategoryScore::new(
                RiskCategory::ContractSecurity,
                0.85,
                0.8,
                DataQuality::Fair,
            )
            .with_warning("UNVERIFIED_CONTRACT: bytecode only, no source to scan")
            .with_details(json!({"verified": false})),
            None => RiskCategoryScore::new(
                RiskCategory::ContractSecurity,
                0.85,
                0.5,
                DataQuality::Fair,
            )
            .with_warning("UNVERIFIED_CONTRACT: no source information available"),
        };

        let mut result = result;
        result.analysis_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::analyzers::RiskAnalyzer;
    use crate::risk::types::ContractSource;

    fn pair() -> NewPairEvent {
        use crate::discovery::event::{PairId, TokenMeta};
        use ethers::types::{Address, H256};
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
    async fn test_clean_source_scores_low() {
        let analyzer = ContractAnalyzer::new();
        let ctx = AnalysisContext {
            contract: Some(ContractSource {
                verified: true,
                source: Some(
                    "contract Token { function transfer(address to, uint v) public {} }".into(),
                ),
            }),
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score < 0.1);
        assert!(!score.is_blocking_failure());
    }

    #[tokio::test]
    async fn test_reentrancy_and_tx_origin_flagged() {
        let analyzer = ContractAnalyzer::new();
        let source = r#"
            contract Bad {
                function withdraw() public {
                    require(tx.origin == owner);
                    msg.sender.call.value(balance)();
                }
            }
        "#;
        let ctx = AnalysisContext {
            contract: Some(ContractSource {
                verified: true,
                source: Some(source.into()),
            }),
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score >= 0.5);
        assert!(score.warnings.iter().any(|w| w.contains("reentrancy")));
        assert!(score.warnings.iter().any(|w| w.contains("tx_origin")));
    }

    #[tokio::test]
    async fn test_unverified_contract_is_high_risk() {
        let analyzer = ContractAnalyzer::new();
        let ctx = AnalysisContext {
            contract: Some(ContractSource {
                verified: false,
                source: None,
            }),
            ..Default::default()
        };
        let score = analyzer.analyze(&pair(), &ctx).await.unwrap();
        assert!(score.score >= 0.8);
        assert!(score
            .warnings
            .iter()
            .any(|w| w.contains("UNVERIFIED_CONTRACT")));
        assert!(score.is_blocking_failure());
    }

    #[test]
    fn test_admin_surface_scoring() {
        let mut source = String::from("contract T {\n");
        for i in 0..6 {
            source.push_str(&format!(
                "function setFee{i}(uint f) public onlyOwner {{ }}\n"
            ));
        }
        source.push('}');
        let (findings, admin_fns) = ContractAnalyzer::scan(&source);
        assert_eq!(admin_fns, 6);
        let score = ContractAnalyzer::score_findings(&findings, admin_fns);
        assert!(score >= 0.2);
    }

    #[test]
    fn test_selfdestruct_detected() {
        let (findings, _) =
            ContractAnalyzer::scan("function kill() public { selfdestruct(owner); }");
        assert!(findings.iter().any(|f| f.kind == "deprecated_suicide"));
    }
}
