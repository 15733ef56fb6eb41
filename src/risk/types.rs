//! Risk assessment data model

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::discovery::NewPairEvent;

/// Risk categories, weighted into the overall score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCategory {
    Honeypot,
    Liquidity,
    ContractSecurity,
    Tax,
    Holder,
    Market,
    Social,
    Technical,
}

impl RiskCategory {
    pub fn all() -> [RiskCategory; 8] {
        [
            RiskCategory::Honeypot,
            RiskCategory::Liquidity,
            RiskCategory::ContractSecurity,
            RiskCategory::Tax,
            RiskCategory::Holder,
            RiskCategory::Market,
            RiskCategory::Social,
            RiskCategory::Technical,
        ]
    }

    /// Weight in the overall score
    pub fn weight(&self) -> f64 {
        match self {
            RiskCategory::Honeypot => 0.25,
            RiskCategory::Liquidity => 0.20,
            RiskCategory::ContractSecurity => 0.15,
            RiskCategory::Tax => 0.15,
            RiskCategory::Holder => 0.10,
            RiskCategory::Market => 0.10,
            RiskCategory::Social => 0.03,
            RiskCategory::Technical => 0.02,
        }
    }

    /// Whether a bad result in this category blocks trading outright
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            RiskCategory::Honeypot | RiskCategory::Liquidity | RiskCategory::ContractSecurity
        )
    }

    /// Cache TTL for assessments dominated by this category
    pub fn cache_ttl_secs(&self) -> u64 {
        match self {
            RiskCategory::Honeypot | RiskCategory::ContractSecurity => 24 * 3600,
            RiskCategory::Liquidity => 15 * 60,
            RiskCategory::Technical => 5 * 60,
            RiskCategory::Market => 10 * 60,
            RiskCategory::Holder => 45 * 60,
            RiskCategory::Tax => 30 * 60,
            RiskCategory::Social => 10 * 60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::Honeypot => "honeypot_detection",
            RiskCategory::Liquidity => "liquidity_analysis",
            RiskCategory::ContractSecurity => "contract_security",
            RiskCategory::Tax => "tax_analysis",
            RiskCategory::Holder => "holder_distribution",
            RiskCategory::Market => "market_structure",
            RiskCategory::Social => "social_sentiment",
            RiskCategory::Technical => "technical_analysis",
        }
    }
}

/// Quality of the data an analyzer had to work with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Score produced by one category analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCategoryScore {
    pub category: RiskCategory,
    /// 0 = safe, 1 = worst
    pub score: f64,
    pub confidence: f64,
    pub data_quality: DataQuality,
    pub warnings: Vec<String>,
    pub details: serde_json::Value,
    pub analysis_time_ms: u64,
}

impl RiskCategoryScore {
    /// Build a score with score and confidence clamped to `[0, 1]`.
    pub fn new(category: RiskCategory, score: f64, confidence: f64, data_quality: DataQuality) -> Self {
        Self {
            category,
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            data_quality,
            warnings: Vec::new(),
            details: serde_json::Value::Null,
            analysis_time_ms: 0,
        }
    }

    /// Synthetic maximum-risk score recorded when an analyzer fails or
    /// times out; the assessment continues instead of aborting.
    pub fn failed(category: RiskCategory, reason: impl Into<String>) -> Self {
        let mut score = Self::new(category, 1.0, 0.0, DataQuality::Poor);
        score.warnings.push(reason.into());
        score
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// A blocking failure: dangerous score or unusable data
    pub fn is_blocking_failure(&self) -> bool {
        self.category.is_blocking() && (self.score >= 0.8 || self.data_quality == DataQuality::Poor)
    }
}

/// Complete assessment for one pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub chain_id: u64,
    pub token_address: Address,
    pub overall_score: f64,
    pub overall_confidence: f64,
    pub is_tradeable: bool,
    pub blocking_issues: Vec<String>,
    pub categories: HashMap<RiskCategory, RiskCategoryScore>,
    pub assessed_at: DateTime<Utc>,
    pub assessment_time_ms: u64,
}

impl RiskAssessment {
    /// Aggregate category scores into an assessment.
    ///
    /// Overall = Σ(scoreᵢ·confᵢ·wᵢ) / Σ(confᵢ·wᵢ); an empty or
    /// zero-confidence set yields maximum risk.
    pub fn aggregate(
        chain_id: u64,
        token_address: Address,
        scores: Vec<RiskCategoryScore>,
        max_acceptable_score: f64,
    ) -> Self {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut confidence_sum = 0.0;
        let mut blocking_issues = Vec::new();
        let mut categories = HashMap::with_capacity(scores.len());

        for score in scores {
            let w = score.category.weight();
            weighted += score.score * score.confidence * w;
            total_weight += score.confidence * w;
            confidence_sum += score.confidence;

            if score.is_blocking_failure() {
                blocking_issues.push(score.category.as_str().to_string());
            }
            categories.insert(score.category, score);
        }

        let overall_score = if total_weight > 0.0 {
            (weighted / total_weight).min(1.0)
        } else {
            1.0
        };

        let overall_confidence = if categories.is_empty() {
            0.0
        } else {
            confidence_sum / categories.len() as f64
        };

        let is_tradeable = blocking_issues.is_empty() && overall_score <= max_acceptable_score;

        Self {
            chain_id,
            token_address,
            overall_score,
            overall_confidence,
            is_tradeable,
            blocking_issues,
            categories,
            assessed_at: Utc::now(),
            assessment_time_ms: 0,
        }
    }

    /// TTL for caching: the tightest TTL among categories that actually
    /// contributed data.
    pub fn cache_ttl_secs(&self) -> u64 {
        self.categories
            .values()
            .filter(|s| s.confidence > 0.0)
            .map(|s| s.category.cache_ttl_secs())
            .min()
            .unwrap_or(RiskCategory::Technical.cache_ttl_secs())
    }

    pub fn honeypot_detected(&self) -> bool {
        self.categories
            .get(&RiskCategory::Honeypot)
            .map(|s| s.score >= 0.8)
            .unwrap_or(false)
    }
}

/// A single point in a price history series
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume_usd: f64,
}

/// Holder balance snapshot entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderBalance {
    pub address: Address,
    pub pct_of_supply: f64,
    pub is_contract: bool,
}

/// One observed trade for market-structure analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub trader: Address,
    pub is_buy: bool,
    pub amount_usd: f64,
}

/// Verified source availability for contract analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSource {
    pub verified: bool,
    pub source: Option<String>,
}

/// Social sentiment observation from an external feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSample {
    pub source: String,
    /// -1 (bearish) .. +1 (bullish)
    pub polarity: f64,
    pub volume: u32,
}

/// Typed context handed to every analyzer.
///
/// All fields are optional; analyzers degrade confidence and data quality
/// when the inputs they need are missing, they never fabricate data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub current_price_usd: Option<Decimal>,
    pub market_cap_usd: Option<Decimal>,
    pub liquidity_usd: Option<Decimal>,
    pub price_history: Vec<PricePoint>,
    pub holders: Vec<HolderBalance>,
    pub holder_count: Option<u32>,
    pub trades: Vec<TradeRecord>,
    pub contract: Option<ContractSource>,
    pub sentiment: Vec<SentimentSample>,
    /// Creator / deployer allocation as a fraction of supply
    pub team_allocation_pct: Option<f64>,
    /// Bid/ask spread estimate as a percentage
    pub spread_pct: Option<f64>,
    /// LP share burned or time-locked, in percent
    pub lp_secured_pct: Option<f64>,
    pub lp_burned_pct: Option<f64>,
}

/// Fast pre-trade check view stored alongside cached assessments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastRiskView {
    pub token_address: Address,
    pub chain_id: u64,
    pub overall_score: f64,
    pub is_tradeable: bool,
    pub honeypot: bool,
}

impl From<&RiskAssessment> for FastRiskView {
    fn from(a: &RiskAssessment) -> Self {
        Self {
            token_address: a.token_address,
            chain_id: a.chain_id,
            overall_score: a.overall_score,
            is_tradeable: a.is_tradeable,
            honeypot: a.honeypot_detected(),
        }
    }
}

/// Convenience: the pair-derived fields analyzers commonly need
pub fn target_token(pair: &NewPairEvent, weth: Address) -> Address {
    if pair.token0.address == weth {
        pair.token1.address
    } else {
        pair.token0.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = RiskCategory::all().iter().map(|c| c.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamping() {
        let s = RiskCategoryScore::new(RiskCategory::Tax, 1.7, -0.2, DataQuality::Good);
        assert_eq!(s.score, 1.0);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn test_aggregate_weighted_mean() {
        let scores = vec![
            RiskCategoryScore::new(RiskCategory::Honeypot, 0.2, 1.0, DataQuality::Good),
            RiskCategoryScore::new(RiskCategory::Liquidity, 0.4, 1.0, DataQuality::Good),
        ];
        let a = RiskAssessment::aggregate(1, Address::zero(), scores, 0.8);

        // (0.2*0.25 + 0.4*0.20) / (0.25 + 0.20)
        let expected = (0.2 * 0.25 + 0.4 * 0.20) / 0.45;
        assert!((a.overall_score - expected).abs() < 1e-9);
        assert!(a.is_tradeable);
        assert!(a.blocking_issues.is_empty());
    }

    #[test]
    fn test_aggregate_zero_confidence_is_max_risk() {
        let scores = vec![RiskCategoryScore::new(
            RiskCategory::Market,
            0.1,
            0.0,
            DataQuality::Poor,
        )];
        let a = RiskAssessment::aggregate(1, Address::zero(), scores, 0.8);
        assert_eq!(a.overall_score, 1.0);
        assert!(!a.is_tradeable);
    }

    #[test]
    fn test_blocking_category_blocks() {
        let scores = vec![
            RiskCategoryScore::new(RiskCategory::Honeypot, 1.0, 1.0, DataQuality::Good),
            RiskCategoryScore::new(RiskCategory::Liquidity, 0.1, 1.0, DataQuality::Good),
        ];
        let a = RiskAssessment::aggregate(1, Address::zero(), scores, 0.8);
        assert!(!a.is_tradeable);
        assert!(a.blocking_issues.contains(&"honeypot_detection".to_string()));
        assert!(a.honeypot_detected());
    }

    #[test]
    fn test_poor_data_on_blocking_category_blocks() {
        let scores = vec![RiskCategoryScore::failed(RiskCategory::Liquidity, "timeout")];
        let a = RiskAssessment::aggregate(1, Address::zero(), scores, 0.8);
        assert!(!a.is_tradeable);
        assert!(a.blocking_issues.contains(&"liquidity_analysis".to_string()));
    }

    #[test]
    fn test_non_blocking_category_never_blocks() {
        let scores = vec![
            RiskCategoryScore::new(RiskCategory::Honeypot, 0.0, 1.0, DataQuality::Good),
            RiskCategoryScore::new(RiskCategory::Liquidity, 0.0, 1.0, DataQuality::Good),
            RiskCategoryScore::new(RiskCategory::Tax, 1.0, 1.0, DataQuality::Good),
        ];
        let a = RiskAssessment::aggregate(1, Address::zero(), scores, 0.8);
        assert!(a.blocking_issues.is_empty());
        // Tax still drags the overall score up through its weight.
        assert!(a.overall_score > 0.2);
    }

    #[test]
    fn test_cache_ttl_uses_tightest_contributor() {
        let scores = vec![
            RiskCategoryScore::new(RiskCategory::Honeypot, 0.0, 1.0, DataQuality::Good),
            RiskCategoryScore::new(RiskCategory::Liquidity, 0.0, 1.0, DataQuality::Good),
        ];
        let a = RiskAssessment::aggregate(1, Address::zero(), scores, 0.8);
        assert_eq!(a.cache_ttl_secs(), 15 * 60);
    }

    #[test]
    fn test_assessment_serde_roundtrip() {
        let scores = vec![RiskCategoryScore::new(
            RiskCategory::Honeypot,
            0.3,
            0.9,
            DataQuality::Excellent,
        )];
        let a = RiskAssessment::aggregate(8453, Address::random(), scores, 0.8);
        let json = serde_json::to_string(&a).unwrap();
        let back: RiskAssessment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token_address, a.token_address);
        assert_eq!(back.overall_score, a.overall_score);
        assert_eq!(back.categories.len(), 1);
    }
}
