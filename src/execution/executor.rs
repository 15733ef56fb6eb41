//! Fast-lane executor
//!
//! A bounded queue of trade decisions drained by a small worker pool.
//! Every trade runs the same ladder inside a hard deadline: validate,
//! fast risk check from cache, gas plan, nonce, build and sign, route
//! (private relay or public mempool), publish the result. Paper mode
//! simulates the fill; shadow mode signs without broadcasting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, Topic};
use crate::chain::ChainConfig;
use crate::config::{ExecutionConfig, TradingMode};
use crate::error::{Error, Result};
use crate::provider::manager::CallRequest;
use crate::provider::ProviderManager;
use crate::relay::{BundleStatus, MevSignals, RelayClient, Route};
use crate::risk::RiskCache;

use super::gas::{GasOptimizer, GasPlan};
use super::nonce::NonceManager;
use super::router::{encode_exact_input_single, wallet_from_key, SwapBuilder};
use super::types::{
    TradeAction, TradeDecision, TradeExecution, TradeOutcome, TradeStatus,
};

/// Fast risk gate: cached overall score must not exceed this
const FAST_RISK_MAX_SCORE: f64 = 0.8;

struct QueuedTrade {
    execution: TradeExecution,
    signals: MevSignals,
}

/// Counters snapshotted into the status surface
#[derive(Debug, Default)]
struct ExecutorStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    queue_full: AtomicU64,
    total_execution_ms: AtomicU64,
}

/// Read-only executor status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub rejected: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub queue_full_rejections: u64,
    pub average_execution_ms: f64,
}

pub struct FastLaneExecutor {
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
    cache: Arc<RiskCache>,
    gas: GasOptimizer,
    nonces: Arc<NonceManager>,
    swap: SwapBuilder,
    relay: Arc<RelayClient>,
    bus: Arc<EventBus>,
    config: ExecutionConfig,
    mode: TradingMode,
    wallet: Option<LocalWallet>,
    /// Native-token USD price, fed by market data from the engine root
    eth_price_usd: Arc<RwLock<Decimal>>,
    queue_tx: async_channel::Sender<QueuedTrade>,
    queue_rx: async_channel::Receiver<QueuedTrade>,
    results: Arc<DashMap<Uuid, TradeExecution>>,
    stats: Arc<ExecutorStats>,
}

impl FastLaneExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<ChainConfig>,
        providers: Arc<ProviderManager>,
        cache: Arc<RiskCache>,
        relay: Arc<RelayClient>,
        bus: Arc<EventBus>,
        config: ExecutionConfig,
        mode: TradingMode,
    ) -> Result<Self> {
        let wallet = if config.signer_key.is_empty() {
            None
        } else {
            Some(wallet_from_key(&config.signer_key, chain.chain_id)?)
        };

        if mode == TradingMode::Live && wallet.is_none() {
            return Err(Error::Config("live mode requires a signer key".into()));
        }

        let (queue_tx, queue_rx) = async_channel::bounded(config.queue_capacity);

        Ok(Self {
            gas: GasOptimizer::new(Arc::clone(&providers), config.max_gas_price_gwei),
            nonces: Arc::new(NonceManager::new(
                Arc::clone(&providers),
                config.nonce_stuck_timeout_secs,
            )),
            swap: SwapBuilder::new(Arc::clone(&chain)),
            eth_price_usd: Arc::new(RwLock::new(dec!(3000))),
            chain,
            providers,
            cache,
            relay,
            bus,
            config,
            mode,
            wallet,
            queue_tx,
            queue_rx,
            results: Arc::new(DashMap::new()),
            stats: Arc::new(ExecutorStats::default()),
        })
    }

    /// Update the native-token price used for USD sizing conversion.
    pub async fn set_native_price(&self, price_usd: Decimal) {
        *self.eth_price_usd.write().await = price_usd;
    }

    /// Enqueue a trade. Returns the trade id, or `QueueFull` when the
    /// bounded queue rejects it (counted, never silent).
    pub fn submit(&self, decision: TradeDecision, signals: MevSignals) -> Result<Uuid> {
        let execution = TradeExecution::pending(decision);
        let trade_id = execution.trade_id;
        self.results.insert(trade_id, execution.clone());

        match self.queue_tx.try_send(QueuedTrade { execution, signals }) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(trade_id)
            }
            Err(async_channel::TrySendError::Full(_)) => {
                self.results.remove(&trade_id);
                self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                warn!(chain = self.chain.chain_id, "Fast-lane queue full; trade rejected");
                Err(Error::QueueFull)
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                self.results.remove(&trade_id);
                Err(Error::Internal("executor queue closed".into()))
            }
        }
    }

    pub fn result(&self, trade_id: &Uuid) -> Option<TradeExecution> {
        self.results.get(trade_id).map(|r| r.clone())
    }

    /// Spawn the worker pool and retention cleanup; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut handles = Vec::new();

        for worker_id in 0..self.config.max_concurrent_trades {
            let executor = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                executor.worker_loop(worker_id, cancel).await;
            }));
        }

        let cleanup = {
            let executor = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor.cleanup_loop(cancel).await;
            })
        };

        for handle in handles {
            let _ = handle.await;
        }
        cleanup.abort();
        info!(chain = self.chain.chain_id, "Fast-lane executor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            let queued = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.queue_rx.recv() => match item {
                    Ok(item) => item,
                    Err(_) => return,
                },
            };

            let trade_id = queued.execution.trade_id;
            let started = Instant::now();
            let deadline = Duration::from_millis(self.config.execution_timeout_ms);

            let mut execution = queued.execution;
            execution.status = TradeStatus::Executing;
            self.results.insert(trade_id, execution.clone());

            let outcome = timeout(deadline, self.execute(&mut execution, &queued.signals)).await;
            execution.execution_time_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(())) => {
                    execution.finish(TradeStatus::Completed, TradeOutcome::Success);
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    let outcome = classify_failure(&e);
                    execution.error = Some(e.to_string());
                    execution.finish(TradeStatus::Failed, outcome);
                    match outcome {
                        TradeOutcome::Rejected => {
                            self.stats.rejected.fetch_add(1, Ordering::Relaxed)
                        }
                        _ => self.stats.failed.fetch_add(1, Ordering::Relaxed),
                    };
                    debug!(worker = worker_id, trade = %trade_id, error = %e, "Trade failed");
                }
                Err(_) => {
                    execution.error = Some(format!(
                        "execution deadline {}ms breached",
                        self.config.execution_timeout_ms
                    ));
                    execution.finish(TradeStatus::Failed, TradeOutcome::Timeout);
                    self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.stats
                .total_execution_ms
                .fetch_add(execution.execution_time_ms, Ordering::Relaxed);
            self.results.insert(trade_id, execution.clone());

            if let Err(e) = self.bus.publish_correlated(
                Topic::ExecutionsResult,
                execution.decision.correlation_id,
                &execution,
            ) {
                warn!(error = %e, "Failed to publish execution result");
            }
        }
    }

    /// The per-trade ladder. Any error return is mapped to a terminal
    /// outcome by the worker loop.
    async fn execute(&self, execution: &mut TradeExecution, signals: &MevSignals) -> Result<()> {
        let decision = execution.decision.clone();

        // (a) validation
        self.validate(&decision)?;

        // (b) fast risk check against the cache only; the fast lane never
        // waits for a fresh assessment.
        let key = (decision.chain_id(), decision.token_address);
        match self.cache.fast_view(&key) {
            None => {
                return Err(Error::RiskBlocked("no cached risk verdict".into()));
            }
            Some(view) => {
                if view.honeypot {
                    return Err(Error::RiskBlocked("cached verdict: honeypot".into()));
                }
                if !view.is_tradeable || view.overall_score > FAST_RISK_MAX_SCORE {
                    return Err(Error::RiskBlocked(format!(
                        "cached risk score {:.2} over limit",
                        view.overall_score
                    )));
                }
            }
        }

        if self.mode == TradingMode::Paper {
            return self.execute_paper(execution).await;
        }

        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| Error::Config("signer required outside paper mode".into()))?;

        // Sizing: buys convert USD to native wei through the fed price;
        // sells liquidate the wallet's full token balance.
        let amount_in = match decision.action {
            TradeAction::Buy => {
                let eth_price = *self.eth_price_usd.read().await;
                usd_to_wei(decision.position_size_usd, eth_price)?
            }
            TradeAction::Sell => {
                let balance = self
                    .token_balance(decision.token_address, wallet.address())
                    .await?;
                if balance.is_zero() {
                    return Err(Error::InsufficientFunds {
                        available: "0".into(),
                        required: decision.position_size_usd.to_string(),
                    });
                }
                balance
            }
            TradeAction::Skip => unreachable!("validated above"),
        };

        // Pre-flight simulation doubles as the expected-out quote.
        let sim_request = CallRequest {
            from: Some(wallet.address()),
            to: self.chain.router_v3,
            value: (decision.action == TradeAction::Buy).then_some(amount_in),
            data: Some(encode_exact_input_single(
                if decision.action == TradeAction::Buy {
                    self.chain.weth
                } else {
                    decision.token_address
                },
                if decision.action == TradeAction::Buy {
                    decision.token_address
                } else {
                    self.chain.weth
                },
                decision.pair_id.fee_tier,
                wallet.address(),
                U256::MAX,
                amount_in,
                U256::zero(),
            )),
        };
        let expected_out = match self.providers.call(&sim_request).await {
            Ok(out) if out.len() >= 32 => U256::from_big_endian(&out[0..32]),
            Ok(_) => U256::zero(),
            Err(Error::Rpc(reason)) => {
                return Err(Error::TransactionSimulation(reason));
            }
            Err(e) => return Err(e),
        };

        // (c) gas plan at the trade's urgency
        let gas = self.gas.plan(&sim_request, decision.priority).await?;

        // (d) nonce
        let nonce = self.nonces.reserve(wallet.address()).await?;

        // (e) build and sign
        let tx = match decision.action {
            TradeAction::Buy => self.swap.build_buy(
                decision.token_address,
                decision.pair_id.fee_tier,
                wallet.address(),
                amount_in,
                expected_out,
                decision.max_slippage_percent,
                &gas,
                nonce,
            ),
            TradeAction::Sell => self.swap.build_sell(
                decision.token_address,
                decision.pair_id.fee_tier,
                wallet.address(),
                amount_in,
                expected_out,
                decision.max_slippage_percent,
                &gas,
                nonce,
            ),
            TradeAction::Skip => unreachable!("validated above"),
        };
        let raw = self.swap.sign(wallet, tx)?;
        let tx_hash = ethers::utils::keccak256(&raw).into();

        if self.mode == TradingMode::Shadow {
            execution.simulation_notes =
                Some("shadow mode: transaction signed but not broadcast".into());
            execution.amount_out = Some(expected_out);
            self.nonces.complete(wallet.address(), nonce).await;
            return Ok(());
        }

        // (f) routing and submission
        let submitted_hash = match self.relay.decide_route(decision.priority, signals) {
            Route::PrivateRelay => {
                let head = self.providers.block_number().await?;
                let receipt = self.relay.submit_bundle(&[raw.clone()], head + 1).await?;
                match self.relay.track_inclusion(&receipt, tx_hash).await? {
                    BundleStatus::Included { tx_hash, .. } => tx_hash,
                    BundleStatus::Expired => {
                        // One-shot public fallback with bumped gas.
                        self.resubmit_public(wallet, execution, &gas, nonce, amount_in, expected_out)
                            .await?
                    }
                }
            }
            Route::PublicMempool => self.send_with_retry(raw).await?,
        };

        execution.tx_hash = Some(submitted_hash);
        execution.amount_out = Some(expected_out);
        execution.gas_used = Some(gas.gas_limit);
        self.nonces.complete(wallet.address(), nonce).await;
        Ok(())
    }

    async fn execute_paper(&self, execution: &mut TradeExecution) -> Result<()> {
        // Simulated fills jitter around the configured latency.
        let latency_ms = {
            use rand::Rng;
            let base = self.config.paper_latency_ms;
            rand::thread_rng().gen_range(base.saturating_sub(base / 5)..=base + base / 5)
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        let slippage = self.config.paper_slippage_percent;
        let fill = execution.decision.position_size_usd
            * (Decimal::ONE - slippage / Decimal::from(100));

        execution.actual_slippage_percent = Some(slippage);
        execution.simulation_notes = Some(format!(
            "paper fill: {:?} ${} at {}% simulated slippage (filled ${fill})",
            execution.decision.action, execution.decision.position_size_usd, slippage,
        ));
        Ok(())
    }

    /// Rebuild with bumped gas and push to the public mempool. One shot.
    async fn resubmit_public(
        &self,
        wallet: &LocalWallet,
        execution: &TradeExecution,
        gas: &GasPlan,
        nonce: u64,
        amount_in: U256,
        expected_out: U256,
    ) -> Result<ethers::types::H256> {
        let decision = &execution.decision;
        let bumped = gas.bumped_percent(self.relay.fallback_gas_bump_percent());

        let tx = match decision.action {
            TradeAction::Sell => self.swap.build_sell(
                decision.token_address,
                decision.pair_id.fee_tier,
                wallet.address(),
                amount_in,
                expected_out,
                decision.max_slippage_percent,
                &bumped,
                nonce,
            ),
            _ => self.swap.build_buy(
                decision.token_address,
                decision.pair_id.fee_tier,
                wallet.address(),
                amount_in,
                expected_out,
                decision.max_slippage_percent,
                &bumped,
                nonce,
            ),
        };
        let raw = self.swap.sign(wallet, tx)?;
        info!(trade = %execution.trade_id, "Bundle expired; re-routing to public mempool");
        self.providers.send_raw_transaction(raw).await
    }

    async fn token_balance(&self, token: ethers::types::Address, owner: ethers::types::Address) -> Result<U256> {
        // balanceOf(address)
        let mut data = vec![0x70, 0xa0, 0x82, 0x31];
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(owner.as_bytes());
        data.extend_from_slice(&word);

        let request = CallRequest {
            to: token,
            data: Some(ethers::types::Bytes::from(data)),
            ..Default::default()
        };
        let out = self.providers.call(&request).await?;
        if out.len() < 32 {
            return Ok(U256::zero());
        }
        Ok(U256::from_big_endian(&out[0..32]))
    }

    /// Public submission with one retry for transient send errors
    /// (nonce gaps, underpriced replacements).
    async fn send_with_retry(&self, raw: ethers::types::Bytes) -> Result<ethers::types::H256> {
        match self.providers.send_raw_transaction(raw.clone()).await {
            Ok(hash) => Ok(hash),
            Err(e) if is_transient_send_error(&e) => {
                debug!(error = %e, "Transient submission error; retrying once");
                self.providers.send_raw_transaction(raw).await
            }
            Err(e) => Err(e),
        }
    }

    fn validate(&self, decision: &TradeDecision) -> Result<()> {
        if decision.action == TradeAction::Skip {
            return Err(Error::RiskBlocked("decision action is SKIP".into()));
        }
        if decision.token_address.is_zero() {
            return Err(Error::TransactionBuild("zero token address".into()));
        }
        if decision.position_size_usd <= Decimal::ZERO {
            return Err(Error::TransactionBuild("non-positive position size".into()));
        }
        if decision.chain_id() != self.chain.chain_id {
            return Err(Error::TransactionBuild(format!(
                "decision for chain {} routed to chain {}",
                decision.chain_id(),
                self.chain.chain_id
            )));
        }
        Ok(())
    }

    async fn cleanup_loop(&self, cancel: CancellationToken) {
        let retention = chrono::Duration::seconds(self.config.result_retention_secs as i64);
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let cutoff = Utc::now() - retention;
            self.results
                .retain(|_, e| !e.is_terminal() || e.completed_at > cutoff);
        }
    }

    pub fn status(&self) -> ExecutorStatus {
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        let rejected = self.stats.rejected.load(Ordering::Relaxed);
        let timed_out = self.stats.timed_out.load(Ordering::Relaxed);
        let finished = (succeeded + failed + rejected + timed_out).max(1);

        ExecutorStatus {
            queue_depth: self.queue_tx.len(),
            queue_capacity: self.config.queue_capacity,
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            succeeded,
            rejected,
            failed,
            timed_out,
            queue_full_rejections: self.stats.queue_full.load(Ordering::Relaxed),
            average_execution_ms: self.stats.total_execution_ms.load(Ordering::Relaxed) as f64
                / finished as f64,
        }
    }
}

fn usd_to_wei(size_usd: Decimal, eth_price_usd: Decimal) -> Result<U256> {
    if eth_price_usd <= Decimal::ZERO {
        return Err(Error::TransactionBuild("no native price available".into()));
    }
    let eth = size_usd / eth_price_usd;
    let wei = (eth * Decimal::from(1_000_000_000u64))
        .to_u128()
        .ok_or_else(|| Error::TransactionBuild("position size overflow".into()))?;
    // Two-step scaling keeps the Decimal within its 96-bit mantissa.
    Ok(U256::from(wei) * U256::exp10(9))
}

fn classify_failure(error: &Error) -> TradeOutcome {
    match error {
        Error::RiskBlocked(_) | Error::TransactionBuild(_) | Error::TransactionSimulation(_) => {
            TradeOutcome::Rejected
        }
        Error::SlippageExceeded { .. } => TradeOutcome::SlippageExceeded,
        Error::InsufficientFunds { .. } => TradeOutcome::InsufficientFunds,
        Error::ExecutionTimeout(_) | Error::RpcTimeout(_) => TradeOutcome::Timeout,
        _ => TradeOutcome::Failed,
    }
}

fn is_transient_send_error(error: &Error) -> bool {
    match error {
        Error::TransactionSend(message) => {
            let lower = message.to_lowercase();
            lower.contains("nonce too low")
                || lower.contains("nonce gap")
                || lower.contains("underpriced")
                || lower.contains("replacement")
        }
        e => e.is_retryable(),
    }
}
