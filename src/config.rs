//! Configuration loading and validation

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

/// Trading mode for the engine
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    /// Simulate fills locally, never touch the chain
    Paper,
    /// Sign real transactions but do not broadcast them
    Shadow,
    /// Broadcast real transactions
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::Paper
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub smart_lane: SmartLaneConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_true")]
    pub testnet_mode: bool,
    #[serde(default = "default_target_chains")]
    pub target_chains: Vec<u64>,
    /// Interval between engine status snapshots on the bus (seconds)
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paper,
            testnet_mode: true,
            target_chains: default_target_chains(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_pairs_per_hour")]
    pub max_pairs_per_hour: u32,
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,
    #[serde(default = "default_http_poll_interval_secs")]
    pub http_poll_interval_secs: u64,
    #[serde(default = "default_websocket_timeout_secs")]
    pub websocket_timeout_secs: u64,
    #[serde(default = "default_websocket_reconnect_delay_secs")]
    pub websocket_reconnect_delay_secs: u64,
    /// Blocks re-scanned behind the head by the polling fallback
    #[serde(default = "default_poll_lookback_blocks")]
    pub poll_lookback_blocks: u64,
    /// Recently-seen pair ids kept for dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pairs_per_hour: default_max_pairs_per_hour(),
            event_batch_size: default_event_batch_size(),
            http_poll_interval_secs: default_http_poll_interval_secs(),
            websocket_timeout_secs: default_websocket_timeout_secs(),
            websocket_reconnect_delay_secs: default_websocket_reconnect_delay_secs(),
            poll_lookback_blocks: default_poll_lookback_blocks(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Consecutive failures before a provider's circuit opens
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    /// Seconds the circuit stays open
    #[serde(default = "default_recovery_time_secs")]
    pub recovery_time_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Probe latency above this demotes a provider to degraded (ms)
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
    /// Probe latency below this promotes a provider back to healthy (ms)
    #[serde(default = "default_healthy_latency_ms")]
    pub healthy_latency_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            failover_threshold: default_failover_threshold(),
            recovery_time_secs: default_recovery_time_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            degraded_latency_ms: default_degraded_latency_ms(),
            healthy_latency_ms: default_healthy_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Hard deadline for a full assessment (seconds)
    #[serde(default = "default_risk_timeout_secs")]
    pub risk_timeout_secs: u64,
    /// Per-analyzer internal timeout (seconds)
    #[serde(default = "default_analyzer_timeout_secs")]
    pub analyzer_timeout_secs: u64,
    #[serde(default = "default_risk_parallel_checks")]
    pub risk_parallel_checks: usize,
    #[serde(default = "default_max_acceptable_risk_score")]
    pub max_acceptable_risk_score: f64,
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: Decimal,
    #[serde(default = "default_max_buy_tax_percent")]
    pub max_buy_tax_percent: Decimal,
    #[serde(default = "default_max_sell_tax_percent")]
    pub max_sell_tax_percent: Decimal,
    #[serde(default = "default_min_holder_count")]
    pub min_holder_count: u32,
    /// Minimum LP locked-or-burned percentage
    #[serde(default = "default_min_locked_percent")]
    pub min_locked_percent: f64,
    /// Per-category cache entry caps
    #[serde(default = "default_cache_capacity_per_category")]
    pub cache_capacity_per_category: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_timeout_secs: default_risk_timeout_secs(),
            analyzer_timeout_secs: default_analyzer_timeout_secs(),
            risk_parallel_checks: default_risk_parallel_checks(),
            max_acceptable_risk_score: default_max_acceptable_risk_score(),
            min_liquidity_usd: default_min_liquidity_usd(),
            max_buy_tax_percent: default_max_buy_tax_percent(),
            max_sell_tax_percent: default_max_sell_tax_percent(),
            min_holder_count: default_min_holder_count(),
            min_locked_percent: default_min_locked_percent(),
            cache_capacity_per_category: default_cache_capacity_per_category(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmartLaneConfig {
    /// Pipeline deadline (seconds); tighter than the full risk deadline
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_analyses")]
    pub max_concurrent_analyses: usize,
    #[serde(default = "default_min_confidence_threshold")]
    pub min_confidence_threshold: f64,
    #[serde(default = "default_min_position_percent")]
    pub min_position_percent: f64,
    #[serde(default = "default_max_position_percent")]
    pub max_position_percent: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    /// Timeframes for technical analysis, in minutes
    #[serde(default = "default_technical_timeframes")]
    pub technical_timeframes: Vec<u32>,
    #[serde(default = "default_stop_loss_percent")]
    pub default_stop_loss_percent: f64,
    #[serde(default = "default_min_stop_loss_percent")]
    pub min_stop_loss_percent: f64,
    #[serde(default = "default_max_stop_loss_percent")]
    pub max_stop_loss_percent: f64,
}

impl Default for SmartLaneConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
            max_concurrent_analyses: default_max_concurrent_analyses(),
            min_confidence_threshold: default_min_confidence_threshold(),
            min_position_percent: default_min_position_percent(),
            max_position_percent: default_max_position_percent(),
            max_positions: default_max_positions(),
            technical_timeframes: default_technical_timeframes(),
            default_stop_loss_percent: default_stop_loss_percent(),
            min_stop_loss_percent: default_min_stop_loss_percent(),
            max_stop_loss_percent: default_max_stop_loss_percent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_trades")]
    pub max_concurrent_trades: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_slippage_percent")]
    pub default_slippage_percent: Decimal,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// Result retention before cleanup (seconds)
    #[serde(default = "default_result_retention_secs")]
    pub result_retention_secs: u64,
    /// Pending nonce age that triggers replacement-by-fee (seconds)
    #[serde(default = "default_nonce_stuck_timeout_secs")]
    pub nonce_stuck_timeout_secs: u64,
    /// Paper-mode fill simulation
    #[serde(default = "default_paper_slippage_percent")]
    pub paper_slippage_percent: Decimal,
    #[serde(default = "default_paper_latency_ms")]
    pub paper_latency_ms: u64,
    /// Hex-encoded signer key; empty in paper mode
    #[serde(default)]
    pub signer_key: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_execution_timeout_ms(),
            max_concurrent_trades: default_max_concurrent_trades(),
            queue_capacity: default_queue_capacity(),
            default_slippage_percent: default_slippage_percent(),
            max_gas_price_gwei: default_max_gas_price_gwei(),
            result_retention_secs: default_result_retention_secs(),
            nonce_stuck_timeout_secs: default_nonce_stuck_timeout_secs(),
            paper_slippage_percent: default_paper_slippage_percent(),
            paper_latency_ms: default_paper_latency_ms(),
            signer_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// MEV risk score at or above which bundles go private
    #[serde(default = "default_mev_risk_threshold")]
    pub mev_risk_threshold: f64,
    /// Blocks a bundle stays eligible for inclusion
    #[serde(default = "default_bundle_window_blocks")]
    pub bundle_window_blocks: u64,
    #[serde(default = "default_relay_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Gas bump applied when falling back to the public mempool (percent)
    #[serde(default = "default_fallback_gas_bump_percent")]
    pub fallback_gas_bump_percent: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mev_risk_threshold: default_mev_risk_threshold(),
            bundle_window_blocks: default_bundle_window_blocks(),
            request_timeout_ms: default_relay_timeout_ms(),
            fallback_gas_bump_percent: default_fallback_gas_bump_percent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioConfig {
    #[serde(default = "default_max_portfolio_size_usd")]
    pub max_portfolio_size_usd: Decimal,
    #[serde(default = "default_max_position_size_usd")]
    pub max_position_size_usd: Decimal,
    #[serde(default = "default_daily_loss_limit_percent")]
    pub daily_loss_limit_percent: Decimal,
    #[serde(default = "default_circuit_breaker_loss_percent")]
    pub circuit_breaker_loss_percent: Decimal,
    /// Single-position share of total portfolio value
    #[serde(default = "default_concentration_limit")]
    pub concentration_limit: f64,
    #[serde(default = "default_consecutive_loss_limit")]
    pub consecutive_loss_limit: u32,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            max_portfolio_size_usd: default_max_portfolio_size_usd(),
            max_position_size_usd: default_max_position_size_usd(),
            daily_loss_limit_percent: default_daily_loss_limit_percent(),
            circuit_breaker_loss_percent: default_circuit_breaker_loss_percent(),
            concentration_limit: default_concentration_limit(),
            consecutive_loss_limit: default_consecutive_loss_limit(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_target_chains() -> Vec<u64> {
    vec![84532]
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_max_pairs_per_hour() -> u32 {
    100
}

fn default_event_batch_size() -> usize {
    50
}

fn default_http_poll_interval_secs() -> u64 {
    5
}

fn default_websocket_timeout_secs() -> u64 {
    30
}

fn default_websocket_reconnect_delay_secs() -> u64 {
    5
}

fn default_poll_lookback_blocks() -> u64 {
    10
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_recovery_time_secs() -> u64 {
    300
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_degraded_latency_ms() -> u64 {
    5_000
}

fn default_healthy_latency_ms() -> u64 {
    2_000
}

fn default_risk_timeout_secs() -> u64 {
    30
}

fn default_analyzer_timeout_secs() -> u64 {
    15
}

fn default_risk_parallel_checks() -> usize {
    4
}

fn default_max_acceptable_risk_score() -> f64 {
    0.8
}

fn default_min_liquidity_usd() -> Decimal {
    dec!(10000)
}

fn default_max_buy_tax_percent() -> Decimal {
    dec!(5.0)
}

fn default_max_sell_tax_percent() -> Decimal {
    dec!(5.0)
}

fn default_min_holder_count() -> u32 {
    50
}

fn default_min_locked_percent() -> f64 {
    80.0
}

fn default_cache_capacity_per_category() -> usize {
    100
}

fn default_pipeline_timeout_secs() -> u64 {
    5
}

fn default_max_concurrent_analyses() -> usize {
    10
}

fn default_min_confidence_threshold() -> f64 {
    0.4
}

fn default_min_position_percent() -> f64 {
    0.5
}

fn default_max_position_percent() -> f64 {
    10.0
}

fn default_max_positions() -> usize {
    10
}

fn default_technical_timeframes() -> Vec<u32> {
    vec![5, 15, 60]
}

fn default_stop_loss_percent() -> f64 {
    8.0
}

fn default_min_stop_loss_percent() -> f64 {
    2.0
}

fn default_max_stop_loss_percent() -> f64 {
    50.0
}

fn default_execution_timeout_ms() -> u64 {
    500
}

fn default_max_concurrent_trades() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_slippage_percent() -> Decimal {
    dec!(1.0)
}

fn default_max_gas_price_gwei() -> u64 {
    300
}

fn default_result_retention_secs() -> u64 {
    3600
}

fn default_nonce_stuck_timeout_secs() -> u64 {
    90
}

fn default_paper_slippage_percent() -> Decimal {
    dec!(0.5)
}

fn default_paper_latency_ms() -> u64 {
    200
}

fn default_mev_risk_threshold() -> f64 {
    0.5
}

fn default_bundle_window_blocks() -> u64 {
    2
}

fn default_relay_timeout_ms() -> u64 {
    5_000
}

fn default_fallback_gas_bump_percent() -> u64 {
    15
}

fn default_max_portfolio_size_usd() -> Decimal {
    dec!(10000)
}

fn default_max_position_size_usd() -> Decimal {
    dec!(1000)
}

fn default_daily_loss_limit_percent() -> Decimal {
    dec!(5.0)
}

fn default_circuit_breaker_loss_percent() -> Decimal {
    dec!(10.0)
}

fn default_concentration_limit() -> f64 {
    0.15
}

fn default_consecutive_loss_limit() -> u32 {
    5
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix DEXLANE_)
            .add_source(
                config::Environment::with_prefix("DEXLANE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("engine.target_chains"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.engine.target_chains.is_empty() {
            anyhow::bail!("target_chains must not be empty");
        }

        if self.execution.default_slippage_percent <= Decimal::ZERO
            || self.execution.default_slippage_percent > dec!(50)
        {
            anyhow::bail!("default_slippage_percent must be in (0, 50]");
        }

        if !(0.0..=1.0).contains(&self.risk.max_acceptable_risk_score) {
            anyhow::bail!("max_acceptable_risk_score must be within [0, 1]");
        }

        if self.smart_lane.min_position_percent > self.smart_lane.max_position_percent {
            anyhow::bail!("min_position_percent cannot exceed max_position_percent");
        }

        if self.smart_lane.min_stop_loss_percent > self.smart_lane.max_stop_loss_percent {
            anyhow::bail!("min_stop_loss_percent cannot exceed max_stop_loss_percent");
        }

        if self.portfolio.max_position_size_usd > self.portfolio.max_portfolio_size_usd {
            anyhow::bail!("max_position_size_usd cannot exceed max_portfolio_size_usd");
        }

        if self.portfolio.daily_loss_limit_percent <= Decimal::ZERO {
            anyhow::bail!("daily_loss_limit_percent must be positive");
        }

        if !(0.0..=1.0).contains(&self.portfolio.concentration_limit) {
            anyhow::bail!("concentration_limit must be within [0, 1]");
        }

        if self.engine.trading_mode == TradingMode::Live {
            if self.execution.signer_key.is_empty() {
                anyhow::bail!("live mode requires execution.signer_key");
            }
            if self.engine.testnet_mode {
                tracing::warn!("Live trading against testnet chains");
            }
        }

        if self.execution.max_concurrent_trades == 0 {
            anyhow::bail!("max_concurrent_trades must be positive");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Engine:
    mode: {:?}
    testnet: {}
    chains: {:?}
  Discovery:
    enabled: {}
    max_pairs_per_hour: {}
    batch_size: {}
    poll_interval: {}s
  Risk:
    deadline: {}s (smart lane {}s)
    max_acceptable_score: {}
    min_liquidity: ${}
    max_taxes: {}%/{}%
  Execution:
    trade_timeout: {}ms
    workers: {}
    queue: {}
    slippage: {}%
    max_gas: {} gwei
    signer_key: {}
  Relay:
    enabled: {}
    mev_threshold: {}
    bundle_window: {} blocks
  Portfolio:
    max_portfolio: ${}
    max_position: ${}
    daily_loss_limit: {}%
    breaker_loss: {}%
"#,
            self.engine.trading_mode,
            self.engine.testnet_mode,
            self.engine.target_chains,
            self.discovery.enabled,
            self.discovery.max_pairs_per_hour,
            self.discovery.event_batch_size,
            self.discovery.http_poll_interval_secs,
            self.risk.risk_timeout_secs,
            self.smart_lane.pipeline_timeout_secs,
            self.risk.max_acceptable_risk_score,
            self.risk.min_liquidity_usd,
            self.risk.max_buy_tax_percent,
            self.risk.max_sell_tax_percent,
            self.execution.execution_timeout_ms,
            self.execution.max_concurrent_trades,
            self.execution.queue_capacity,
            self.execution.default_slippage_percent,
            self.execution.max_gas_price_gwei,
            if self.execution.signer_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.relay.enabled,
            self.relay.mev_risk_threshold,
            self.relay.bundle_window_blocks,
            self.portfolio.max_portfolio_size_usd,
            self.portfolio.max_position_size_usd,
            self.portfolio.daily_loss_limit_percent,
            self.portfolio.circuit_breaker_loss_percent,
        )
    }

    pub fn is_paper_mode(&self) -> bool {
        self.engine.trading_mode == TradingMode::Paper
    }

    pub fn is_live_mode(&self) -> bool {
        self.engine.trading_mode == TradingMode::Live
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            discovery: DiscoveryConfig::default(),
            provider: ProviderConfig::default(),
            risk: RiskConfig::default(),
            smart_lane: SmartLaneConfig::default(),
            execution: ExecutionConfig::default(),
            relay: RelayConfig::default(),
            portfolio: PortfolioConfig::default(),
        }
    }
}
