//! Engine root
//!
//! Owns every component for the process lifetime and wires the pipeline:
//! discovery feeds the bus, the decision loop runs pairs through the
//! smart lane, the portfolio gate clears them, and the fast-lane executor
//! submits. All construction is explicit; nothing lives in globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, Topic};
use crate::chain::ChainRegistry;
use crate::config::Config;
use crate::discovery::{DiscoveryManager, DiscoveryService, NewPairEvent};
use crate::error::{Error, Result};
use crate::execution::types::{TradeAction, TradeDecision, TradePriority};
use crate::execution::{FastLaneExecutor, TradeExecution, TradeOutcome};
use crate::portfolio::position::Position;
use crate::portfolio::PortfolioManager;
use crate::provider::ProviderManager;
use crate::relay::{MevSignals, RelayClient};
use crate::risk::types::AnalysisContext;
use crate::risk::{RiskCache, RiskEngine};
use crate::smart_lane::pipeline::PortfolioView;
use crate::smart_lane::{SmartLanePipeline, SmartLaneRecommendation};

/// Operator-facing engine state banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Running,
    Degraded,
    Halted,
}

/// Published on `engine.status` every status interval
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub uptime_secs: u64,
    pub chains: Vec<u64>,
    pub pairs_discovered: u64,
    pub pairs_delivered: u64,
    pub trades_submitted: u64,
    pub trades_succeeded: u64,
    pub portfolio_value_usd: String,
    pub active_breakers: usize,
    pub produced_at: DateTime<Utc>,
}

/// Per-chain component bundle
struct ChainRuntime {
    providers: Arc<ProviderManager>,
    discovery: Arc<DiscoveryService>,
    risk: Arc<RiskEngine>,
    pipeline: Arc<SmartLanePipeline>,
    executor: Arc<FastLaneExecutor>,
}

pub struct Engine {
    config: Config,
    bus: Arc<EventBus>,
    portfolio: Arc<PortfolioManager>,
    chains: HashMap<u64, ChainRuntime>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    pair_rx: Option<mpsc::Receiver<NewPairEvent>>,
}

impl Engine {
    /// Build the full component graph for the configured chains.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(ChainRegistry::for_chains(
            &config.engine.target_chains,
            config.engine.testnet_mode,
        )?);

        let bus = EventBus::new(1024);
        let portfolio = PortfolioManager::new(config.portfolio.clone(), &registry.chain_ids());

        // Shared pair funnel: every chain's discovery feeds one channel.
        let (pair_tx, pair_rx) = mpsc::channel(config.discovery.event_batch_size * 4);

        let mut chains = HashMap::new();
        for chain_config in registry.chains() {
            let chain = Arc::new(chain_config.clone());
            let providers = Arc::new(ProviderManager::new(
                Arc::clone(&chain),
                config.provider.clone(),
            )?);

            let cache = RiskCache::new(config.risk.cache_capacity_per_category);
            let risk = Arc::new(RiskEngine::new(
                Arc::clone(&chain),
                Arc::clone(&providers),
                Arc::clone(&cache),
                config.risk.clone(),
            ));

            let relay = Arc::new(RelayClient::new(
                Arc::clone(&chain),
                Arc::clone(&providers),
                config.relay.clone(),
            )?);

            let executor = Arc::new(FastLaneExecutor::new(
                Arc::clone(&chain),
                Arc::clone(&providers),
                Arc::clone(&cache),
                relay,
                Arc::clone(&bus),
                config.execution.clone(),
                config.engine.trading_mode,
            )?);

            let pipeline = Arc::new(SmartLanePipeline::new(
                Arc::clone(&risk),
                chain.weth,
                config.smart_lane.clone(),
            ));

            let discovery = Arc::new(DiscoveryService::new(
                Arc::clone(&chain),
                Arc::clone(&providers),
                config.discovery.clone(),
                pair_tx.clone(),
            ));

            chains.insert(
                chain.chain_id,
                ChainRuntime {
                    providers,
                    discovery,
                    risk,
                    pipeline,
                    executor,
                },
            );
        }

        info!(
            chains = chains.len(),
            mode = ?config.engine.trading_mode,
            "Engine constructed"
        );

        Ok(Self {
            config,
            bus,
            portfolio,
            chains,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            pair_rx: Some(pair_rx),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn portfolio(&self) -> &Arc<PortfolioManager> {
        &self.portfolio
    }

    /// Run until cancelled. Spawns every component task and the decision
    /// loop, then performs an ordered shutdown.
    pub async fn run(mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut tasks = Vec::new();

        // Discovery manager fans pairs into the bus.
        let pair_rx = self
            .pair_rx
            .take()
            .ok_or_else(|| Error::Internal("engine already started".into()))?;
        let manager = Arc::new(DiscoveryManager::new(
            Arc::clone(&self.bus),
            &self.config.discovery,
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&manager).run(pair_rx, cancel.clone()),
        ));

        for (chain_id, runtime) in &self.chains {
            if self.config.discovery.enabled {
                let discovery = Arc::clone(&runtime.discovery);
                let c = cancel.clone();
                let id = *chain_id;
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = discovery.run(c).await {
                        error!(chain = id, error = %e, "Discovery service failed");
                    }
                }));
            } else {
                info!(chain = chain_id, "Discovery disabled; standby mode");
            }

            let executor = Arc::clone(&runtime.executor);
            let c = cancel.clone();
            tasks.push(tokio::spawn(executor.run(c)));

            // Provider health probes
            let providers = Arc::clone(&runtime.providers);
            let c = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(providers.health_check_interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = c.cancelled() => return,
                        _ = interval.tick() => providers.run_health_checks().await,
                    }
                }
            }));
        }

        // Decision loop and bookkeeping
        let engine = Arc::new(self);
        {
            let e = Arc::clone(&engine);
            let c = cancel.clone();
            tasks.push(tokio::spawn(async move { e.decision_loop(c).await }));
        }
        {
            let e = Arc::clone(&engine);
            let c = cancel.clone();
            tasks.push(tokio::spawn(async move { e.results_loop(c).await }));
        }
        {
            let e = Arc::clone(&engine);
            let c = cancel.clone();
            let m = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { e.status_loop(m, c).await }));
        }

        info!("Engine running");
        cancel.cancelled().await;
        info!("Engine shutting down");

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Pair events → smart lane → portfolio gate → executor.
    async fn decision_loop(&self, cancel: CancellationToken) {
        let mut pairs = self.bus.subscribe(Topic::PairsNew);

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => return,
                envelope = pairs.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };

            let pair: NewPairEvent = match envelope.decode() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Undecodable pair event");
                    continue;
                }
            };

            if let Err(e) = self.handle_pair(pair, envelope.correlation_id).await {
                if e.is_safety_violation() {
                    info!(error = %e, "Pair skipped by safety gate");
                } else {
                    warn!(error = %e, "Pair handling failed");
                }
            }
        }
    }

    async fn handle_pair(&self, pair: NewPairEvent, correlation_id: Uuid) -> Result<()> {
        let runtime = self
            .chains
            .get(&pair.chain_id())
            .ok_or(Error::UnknownChain(pair.chain_id()))?;

        // Context assembly is external-feed territory; a fresh pair has
        // only what discovery enriched.
        let ctx = AnalysisContext::default();
        let portfolio_view = PortfolioView {
            heat_pct: self.portfolio.heat_pct().await,
            max_heat_pct: 20.0,
            open_positions: self.portfolio.open_position_count().await,
            pnl_history: Vec::new(),
        };

        let analysis = runtime.pipeline.analyze(&pair, &ctx, &portfolio_view).await;

        // The pipeline populated the cache; publish the underlying
        // assessment and raise an alert when the pair is risk-blocked.
        let key = (pair.chain_id(), analysis.token_address);
        if let Some(assessment) = runtime.risk.cache().get(&key) {
            self.bus
                .publish_correlated(Topic::RiskAssessment, correlation_id, &assessment)?;
            if !assessment.is_tradeable {
                self.bus.publish_correlated(
                    Topic::AlertsTriggered,
                    correlation_id,
                    &serde_json::json!({
                        "kind": "risk_blocked",
                        "chain_id": pair.chain_id(),
                        "token": format!("{:#x}", analysis.token_address),
                        "pool": format!("{:#x}", pair.pool_address),
                        "blocking_issues": assessment.blocking_issues,
                        "honeypot": assessment.honeypot_detected(),
                    }),
                )?;
            }
        }

        let Some(decision) = self.decision_from(&pair, &analysis, correlation_id) else {
            return Ok(());
        };

        // Portfolio gate before anything touches the executor.
        self.portfolio
            .can_open_position(decision.position_size_usd, decision.chain_id())
            .await?;

        self.bus
            .publish_correlated(Topic::DecisionsTrading, correlation_id, &decision)?;

        runtime.executor.submit(decision, MevSignals::default())?;
        Ok(())
    }

    /// Map a smart-lane recommendation to an executable decision.
    fn decision_from(
        &self,
        pair: &NewPairEvent,
        analysis: &crate::smart_lane::SmartLaneAnalysis,
        correlation_id: Uuid,
    ) -> Option<TradeDecision> {
        let action = match analysis.recommendation {
            SmartLaneRecommendation::Buy
            | SmartLaneRecommendation::PartialBuy
            | SmartLaneRecommendation::ScaleIn => TradeAction::Buy,
            SmartLaneRecommendation::Sell => TradeAction::Sell,
            SmartLaneRecommendation::Hold
            | SmartLaneRecommendation::Wait
            | SmartLaneRecommendation::Avoid => return None,
        };

        let size_usd = self.config.portfolio.max_position_size_usd
            * rust_decimal::Decimal::try_from(analysis.position_size_percent / 100.0).ok()?;
        if size_usd <= rust_decimal::Decimal::ZERO {
            return None;
        }

        // Fresh WETH pairs caught quickly are the fast lane's reason to
        // exist; everything else travels at high priority.
        let priority = if pair.is_weth_pair && pair.discovery_latency_ms < 1_000 {
            TradePriority::Urgent
        } else {
            TradePriority::High
        };

        Some(TradeDecision {
            pair_id: pair.pair_id,
            token_address: analysis.token_address,
            action,
            confidence_score: analysis.overall_confidence,
            position_size_usd: size_usd,
            max_slippage_percent: self.config.execution.default_slippage_percent,
            priority,
            correlation_id,
        })
    }

    /// Apply a market-feed price update: positions re-evaluate their
    /// stops and targets, and fired exits go straight to the fast lane.
    pub async fn apply_price_update(
        &self,
        chain_id: u64,
        token: ethers::types::Address,
        price_usd: rust_decimal::Decimal,
    ) -> Result<usize> {
        let triggered = self.portfolio.update_price(chain_id, token, price_usd).await?;
        if triggered.is_empty() {
            return Ok(0);
        }

        let runtime = self
            .chains
            .get(&chain_id)
            .ok_or(Error::UnknownChain(chain_id))?;

        let mut submitted = 0;
        for (position, check) in &triggered {
            let correlation_id = Uuid::new_v4();
            let decision = TradeDecision {
                pair_id: crate::discovery::PairId {
                    chain_id,
                    token0: token,
                    token1: runtime.providers.chain().weth,
                    fee_tier: 3000,
                },
                token_address: token,
                action: TradeAction::Sell,
                confidence_score: 1.0,
                position_size_usd: position.current_value_usd(),
                max_slippage_percent: self.config.execution.default_slippage_percent,
                priority: TradePriority::Urgent,
                correlation_id,
            };

            info!(
                chain = chain_id,
                token = %token,
                position = %position.position_id,
                trigger = ?check,
                "Exit level fired; submitting sell"
            );

            match runtime.executor.submit(decision, MevSignals::default()) {
                Ok(_) => submitted += 1,
                Err(e) => warn!(error = %e, "Exit sell could not be queued"),
            }
        }
        Ok(submitted)
    }

    /// Execution results → portfolio bookkeeping.
    async fn results_loop(&self, cancel: CancellationToken) {
        let mut results = self.bus.subscribe(Topic::ExecutionsResult);

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => return,
                envelope = results.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };

            let execution: TradeExecution = match envelope.decode() {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Undecodable execution result");
                    continue;
                }
            };

            if execution.outcome != Some(TradeOutcome::Success) {
                continue;
            }

            match execution.decision.action {
                TradeAction::Buy => {
                    // Position opens on a normalized price basis of 1.0;
                    // market-feed updates arrive as relative prices.
                    let position = Position::open(
                        execution.decision.chain_id(),
                        execution.decision.token_address,
                        String::new(),
                        execution.decision.position_size_usd,
                        dec!(1.0),
                        Some(dec!(0.85)),
                        Some(dec!(1.30)),
                    );
                    if let Err(e) = self.portfolio.open_position(position).await {
                        warn!(error = %e, "Executed buy could not be booked");
                    }
                }
                TradeAction::Sell | TradeAction::Skip => {}
            }
        }
    }

    /// Periodic engine.status publication.
    async fn status_loop(&self, manager: Arc<DiscoveryManager>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.engine.status_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let status = self.status(&manager).await;
            if let Err(e) = self.bus.publish(Topic::EngineStatus, &status) {
                warn!(error = %e, "Failed to publish engine status");
            }
        }
    }

    pub async fn status(&self, manager: &DiscoveryManager) -> EngineStatus {
        use std::sync::atomic::Ordering;

        let snapshot = self.portfolio.snapshot().await;

        let mut discovered = 0;
        let mut submitted = 0;
        let mut succeeded = 0;
        let mut degraded = false;
        for runtime in self.chains.values() {
            discovered += runtime
                .discovery
                .stats
                .pairs_discovered
                .load(Ordering::Relaxed);
            let status = runtime.executor.status();
            submitted += status.submitted;
            succeeded += status.succeeded;

            let health = runtime.providers.health_summary().await;
            if health
                .iter()
                .all(|p| p.status != crate::provider::ProviderStatus::Healthy)
            {
                degraded = true;
            }
        }

        let state = if !snapshot.active_breakers.is_empty() {
            EngineState::Halted
        } else if degraded {
            EngineState::Degraded
        } else {
            EngineState::Running
        };

        EngineStatus {
            state,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            chains: self.chains.keys().copied().collect(),
            pairs_discovered: discovered,
            pairs_delivered: manager.stats.delivered.load(Ordering::Relaxed),
            trades_submitted: submitted,
            trades_succeeded: succeeded,
            portfolio_value_usd: snapshot.total_value_usd.to_string(),
            active_breakers: snapshot.active_breakers.len(),
            produced_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingMode;

    fn paper_config() -> Config {
        let mut config = Config::default();
        config.engine.trading_mode = TradingMode::Paper;
        config.engine.testnet_mode = false;
        config.engine.target_chains = vec![1, 8453];
        config
    }

    #[tokio::test]
    async fn test_engine_constructs_all_chains() {
        let engine = Engine::new(paper_config()).unwrap();
        assert_eq!(engine.chains.len(), 2);
        assert!(engine.chains.contains_key(&1));
        assert!(engine.chains.contains_key(&8453));
    }

    #[tokio::test]
    async fn test_engine_rejects_unknown_chain() {
        let mut config = paper_config();
        config.engine.target_chains = vec![424242];
        assert!(Engine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_status_reflects_breakers() {
        let engine = Engine::new(paper_config()).unwrap();
        let manager = DiscoveryManager::new(Arc::clone(&engine.bus), &engine.config.discovery);

        let status = engine.status(&manager).await;
        assert_ne!(status.state, EngineState::Halted);

        engine.portfolio.emergency_stop("test").await;
        let status = engine.status(&manager).await;
        assert_eq!(status.state, EngineState::Halted);
    }

    #[tokio::test]
    async fn test_decision_mapping() {
        use crate::discovery::event::{PairId, TokenMeta};
        use crate::smart_lane::pipeline::ConfidenceLevel;
        use crate::smart_lane::technical::TechnicalSummary;
        use ethers::types::{Address, H256};

        let engine = Engine::new(paper_config()).unwrap();
        let t0 = Address::random();
        let t1 = Address::random();
        let pair = NewPairEvent {
            pair_id: PairId { chain_id: 1, token0: t0, token1: t1, fee_tier: 3000 },
            pool_address: Address::random(),
            token0: TokenMeta { address: t0, symbol: "NEW".into(), decimals: 18 },
            token1: TokenMeta { address: t1, symbol: "WETH".into(), decimals: 18 },
            tick_spacing: 60,
            block_number: 1,
            tx_hash: H256::zero(),
            discovered_at: Utc::now(),
            is_weth_pair: true,
            is_stablecoin_pair: false,
            discovery_latency_ms: 300,
        };

        let mk = |rec, size| crate::smart_lane::SmartLaneAnalysis {
            analysis_id: Uuid::new_v4(),
            chain_id: 1,
            token_address: t0,
            recommendation: rec,
            confidence_level: ConfidenceLevel::High,
            position_size_percent: size,
            stop_loss_percent: Some(15.0),
            take_profit_targets: vec![25.0, 50.0],
            max_hold_time_hours: None,
            overall_risk_score: 0.2,
            overall_confidence: 0.85,
            technical_signals: Vec::new(),
            technical_summary: TechnicalSummary::default(),
            warnings: Vec::new(),
            analyzed_at: Utc::now(),
            total_analysis_time_ms: 100,
        };

        let id = Uuid::new_v4();
        let buy = engine
            .decision_from(&pair, &mk(SmartLaneRecommendation::Buy, 8.0), id)
            .unwrap();
        assert_eq!(buy.action, TradeAction::Buy);
        assert_eq!(buy.priority, TradePriority::Urgent);
        assert_eq!(buy.correlation_id, id);
        // 8% of $1000 max position
        assert_eq!(buy.position_size_usd, rust_decimal_macros::dec!(80));

        assert!(engine
            .decision_from(&pair, &mk(SmartLaneRecommendation::Avoid, 8.0), id)
            .is_none());
        assert!(engine
            .decision_from(&pair, &mk(SmartLaneRecommendation::Buy, 0.0), id)
            .is_none());
    }
}
