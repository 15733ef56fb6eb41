//! Risk assessment engine
//!
//! Fans the enabled analyzers out in parallel, applies per-analyzer
//! timeouts and a hard overall deadline, and aggregates the category
//! scores into one assessment. Analyzer failures become synthetic
//! maximum-risk scores; the assessment itself never aborts.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::chain::ChainConfig;
use crate::config::RiskConfig;
use crate::discovery::NewPairEvent;
use crate::error::Result;
use crate::provider::ProviderManager;

use super::analyzers::{build_registry, RiskAnalyzer};
use super::cache::RiskCache;
use super::types::{
    target_token, AnalysisContext, RiskAssessment, RiskCategoryScore,
};

pub struct RiskEngine {
    chain: Arc<ChainConfig>,
    analyzers: Vec<Arc<dyn RiskAnalyzer>>,
    cache: Arc<RiskCache>,
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(
        chain: Arc<ChainConfig>,
        providers: Arc<ProviderManager>,
        cache: Arc<RiskCache>,
        config: RiskConfig,
    ) -> Self {
        let analyzers = build_registry(Arc::clone(&chain), providers, &config);
        Self {
            chain,
            analyzers,
            cache,
            config,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_analyzers(
        chain: Arc<ChainConfig>,
        analyzers: Vec<Arc<dyn RiskAnalyzer>>,
        cache: Arc<RiskCache>,
        config: RiskConfig,
    ) -> Self {
        Self {
            chain,
            analyzers,
            cache,
            config,
        }
    }

    /// Assess a pair under the default deadline, going through the cache.
    pub async fn assess(
        &self,
        pair: &NewPairEvent,
        ctx: &AnalysisContext,
    ) -> Result<RiskAssessment> {
        self.assess_with_deadline(
            pair,
            ctx,
            Duration::from_secs(self.config.risk_timeout_secs),
        )
        .await
    }

    /// Assess with an explicit deadline (the smart lane uses a tighter
    /// one). Cached verdicts are returned directly; concurrent calls for
    /// the same token coalesce onto one build.
    pub async fn assess_with_deadline(
        &self,
        pair: &NewPairEvent,
        ctx: &AnalysisContext,
        deadline: Duration,
    ) -> Result<RiskAssessment> {
        let token = target_token(pair, self.chain.weth);
        let key = (self.chain.chain_id, token);

        self.cache
            .get_or_build(key, || Box::pin(self.run_assessment(pair, ctx, deadline)))
            .await
    }

    /// Execute every analyzer in parallel and aggregate.
    async fn run_assessment(
        &self,
        pair: &NewPairEvent,
        ctx: &AnalysisContext,
        deadline: Duration,
    ) -> Result<RiskAssessment> {
        let started = Instant::now();
        let token = target_token(pair, self.chain.weth);
        let per_analyzer = Duration::from_secs(self.config.analyzer_timeout_secs).min(deadline);

        let tasks = self.analyzers.iter().map(|analyzer| {
            let analyzer = Arc::clone(analyzer);
            let category = analyzer.category();
            async move {
                match timeout(per_analyzer, analyzer.analyze(pair, ctx)).await {
                    Ok(Ok(score)) => score,
                    Ok(Err(e)) => {
                        warn!(
                            category = category.as_str(),
                            error = %e,
                            "Analyzer failed"
                        );
                        RiskCategoryScore::failed(category, format!("analysis failed: {e}"))
                    }
                    Err(_) => {
                        warn!(
                            category = category.as_str(),
                            timeout_secs = per_analyzer.as_secs(),
                            "Analyzer timed out"
                        );
                        RiskCategoryScore::failed(
                            category,
                            format!("analysis timed out after {}s", per_analyzer.as_secs()),
                        )
                    }
                }
            }
        });

        // Fan out with bounded parallelism under the overall deadline; on
        // breach every still-pending category is recorded as timed out
        // rather than silently dropped.
        let parallelism = self.config.risk_parallel_checks.max(1);
        let run_all = async {
            futures::stream::iter(tasks)
                .buffer_unordered(parallelism)
                .collect::<Vec<_>>()
                .await
        };
        let scores = match timeout(deadline, run_all).await {
            Ok(scores) => scores,
            Err(_) => {
                warn!(
                    chain = self.chain.chain_id,
                    token = %token,
                    deadline_secs = deadline.as_secs(),
                    "Risk assessment deadline breached"
                );
                self.analyzers
                    .iter()
                    .map(|a| {
                        RiskCategoryScore::failed(
                            a.category(),
                            format!("assessment deadline ({}s) breached", deadline.as_secs()),
                        )
                    })
                    .collect()
            }
        };

        let mut assessment = RiskAssessment::aggregate(
            self.chain.chain_id,
            token,
            scores,
            self.config.max_acceptable_risk_score,
        );
        assessment.assessment_time_ms = started.elapsed().as_millis() as u64;

        debug!(
            chain = self.chain.chain_id,
            token = %token,
            score = assessment.overall_score,
            tradeable = assessment.is_tradeable,
            elapsed_ms = assessment.assessment_time_ms,
            "Risk assessment complete"
        );

        Ok(assessment)
    }

    pub fn cache(&self) -> &Arc<RiskCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRegistry;
    use crate::risk::types::{DataQuality, RiskCategory};
    use async_trait::async_trait;
    use ethers::types::{Address, H256};

    struct FixedAnalyzer {
        category: RiskCategory,
        score: f64,
        delay_ms: u64,
    }

    #[async_trait]
    impl RiskAnalyzer for FixedAnalyzer {
        fn category(&self) -> RiskCategory {
            self.category
        }

        async fn analyze(
            &self,
            _pair: &NewPairEvent,
            _ctx: &AnalysisContext,
        ) -> Result<RiskCategoryScore> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(RiskCategoryScore::new(
                self.category,
                self.score,
                0.9,
                DataQuality::Good,
            ))
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl RiskAnalyzer for FailingAnalyzer {
        fn category(&self) -> RiskCategory {
            RiskCategory::Market
        }

        async fn analyze(
            &self,
            _pair: &NewPairEvent,
            _ctx: &AnalysisContext,
        ) -> Result<RiskCategoryScore> {
            Err(crate::error::Error::Rpc("boom".into()))
        }
    }

    fn chain() -> Arc<ChainConfig> {
        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        Arc::new(registry.get(1).unwrap().clone())
    }

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

    fn engine(analyzers: Vec<Arc<dyn RiskAnalyzer>>) -> RiskEngine {
        RiskEngine::with_analyzers(
            chain(),
            analyzers,
            RiskCache::new(10),
            RiskConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_parallel_scores_aggregate() {
        let engine = engine(vec![
            Arc::new(FixedAnalyzer {
                category: RiskCategory::Honeypot,
                score: 0.1,
                delay_ms: 0,
            }),
            Arc::new(FixedAnalyzer {
                category: RiskCategory::Liquidity,
                score: 0.2,
                delay_ms: 0,
            }),
        ]);

        let a = engine
            .assess(&pair(), &AnalysisContext::default())
            .await
            .unwrap();
        assert!(a.is_tradeable);
        assert_eq!(a.categories.len(), 2);
        assert!(a.overall_score < 0.3);
    }

    #[tokio::test]
    async fn test_analyzer_failure_becomes_synthetic_score() {
        let engine = engine(vec![
            Arc::new(FixedAnalyzer {
                category: RiskCategory::Honeypot,
                score: 0.0,
                delay_ms: 0,
            }),
            Arc::new(FailingAnalyzer),
        ]);

        let a = engine
            .assess(&pair(), &AnalysisContext::default())
            .await
            .unwrap();

        let market = &a.categories[&RiskCategory::Market];
        assert_eq!(market.score, 1.0);
        assert_eq!(market.confidence, 0.0);
        assert_eq!(market.data_quality, DataQuality::Poor);
        assert!(!market.warnings.is_empty());
        // Market is non-blocking; the assessment still stands.
        assert!(a.is_tradeable);
    }

    #[tokio::test]
    async fn test_slow_analyzer_times_out() {
        let mut config = RiskConfig::default();
        config.analyzer_timeout_secs = 1;
        let engine = RiskEngine::with_analyzers(
            chain(),
            vec![Arc::new(FixedAnalyzer {
                category: RiskCategory::Honeypot,
                score: 0.0,
                delay_ms: 5_000,
            })],
            RiskCache::new(10),
            config,
        );

        tokio::time::pause();
        let handle = tokio::spawn({
            let p = pair();
            async move { engine.assess(&p, &AnalysisContext::default()).await }
        });
        tokio::time::advance(Duration::from_secs(6)).await;
        let a = handle.await.unwrap().unwrap();

        let honeypot = &a.categories[&RiskCategory::Honeypot];
        assert_eq!(honeypot.score, 1.0);
        assert!(honeypot.warnings.iter().any(|w| w.contains("timed out")));
        assert!(!a.is_tradeable);
    }

    #[tokio::test]
    async fn test_second_assessment_hits_cache() {
        let engine = engine(vec![Arc::new(FixedAnalyzer {
            category: RiskCategory::Honeypot,
            score: 0.1,
            delay_ms: 0,
        })]);

        let p = pair();
        let first = engine.assess(&p, &AnalysisContext::default()).await.unwrap();
        let second = engine.assess(&p, &AnalysisContext::default()).await.unwrap();
        assert_eq!(first.assessed_at, second.assessed_at);
        assert_eq!(engine.cache().stats().hits, 1);
    }
}
