//! Per-chain provider pool with failover execution
//!
//! All JSON-RPC traffic for a chain flows through here: best-provider
//! selection, token-bucket acquisition, latency accounting and circuit
//! breaking. `execute` retries across providers with exponential backoff;
//! connection-shaped errors demote the provider that produced them,
//! semantic errors do not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{ChainConfig, RpcProviderConfig};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

use super::health::{ProviderHealth, ProviderStatus};
use super::rate_limit::TokenBucket;

/// Failover attempt schedule: 0.5 s, 1 s, 2 s
const FAILOVER_BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

struct ProviderSlot {
    config: RpcProviderConfig,
    health: RwLock<ProviderHealth>,
    limiter: TokenBucket,
}

/// Serializable health snapshot for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub status: ProviderStatus,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
}

/// eth_call / eth_estimateGas request body
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

/// eth_getLogs filter
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub address: Option<Address>,
    pub topic0: Option<H256>,
}

impl LogFilter {
    fn to_params(&self) -> Value {
        let mut filter = serde_json::Map::new();
        if let Some(from) = self.from_block {
            filter.insert("fromBlock".into(), json!(to_hex(from)));
        }
        if let Some(to) = self.to_block {
            filter.insert("toBlock".into(), json!(to_hex(to)));
        }
        if let Some(addr) = self.address {
            filter.insert("address".into(), json!(addr));
        }
        if let Some(topic) = self.topic0 {
            filter.insert("topics".into(), json!([topic]));
        }
        Value::Object(filter)
    }
}

/// Per-chain RPC provider pool
pub struct ProviderManager {
    chain: Arc<ChainConfig>,
    cfg: ProviderConfig,
    slots: Vec<ProviderSlot>,
    http: reqwest::Client,
    request_id: AtomicU64,
    failover_count: AtomicU64,
}

impl ProviderManager {
    pub fn new(chain: Arc<ChainConfig>, cfg: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        let slots = chain
            .providers
            .iter()
            .map(|p| ProviderSlot {
                health: RwLock::new(ProviderHealth::new(p.priority, cfg.failover_threshold)),
                limiter: TokenBucket::new(p.max_rps),
                config: p.clone(),
            })
            .collect::<Vec<_>>();

        if slots.is_empty() {
            return Err(Error::Config(format!(
                "chain {} has no providers",
                chain.chain_id
            )));
        }

        info!(
            chain = chain.chain_id,
            providers = slots.len(),
            "Provider manager initialized"
        );

        Ok(Self {
            chain,
            cfg,
            slots,
            http,
            request_id: AtomicU64::new(1),
            failover_count: AtomicU64::new(0),
        })
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    /// Pick the currently best provider by priority score.
    async fn select_best(&self) -> Result<usize> {
        let now = Utc::now();
        let mut best: Option<(usize, f64)> = None;

        for (idx, slot) in self.slots.iter().enumerate() {
            let mut health = slot.health.write().await;
            if !health.is_available(now) {
                continue;
            }
            let score = health.priority_score();
            if best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some((idx, score));
            }
        }

        best.map(|(idx, _)| idx)
            .ok_or(Error::NoHealthyProvider(self.chain.chain_id))
    }

    /// Best provider's WebSocket URL, if any provider exposes one.
    pub async fn best_ws_url(&self) -> Result<String> {
        let now = Utc::now();
        let mut best: Option<(f64, String)> = None;

        for slot in &self.slots {
            let Some(ws) = slot.config.ws_url.clone() else {
                continue;
            };
            let mut health = slot.health.write().await;
            if !health.is_available(now) {
                continue;
            }
            let score = health.priority_score();
            if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
                best = Some((score, ws));
            }
        }

        best.map(|(_, url)| url)
            .ok_or(Error::NoHealthyProvider(self.chain.chain_id))
    }

    /// Single dispatch against one provider, with rate limiting and
    /// health accounting.
    async fn dispatch(&self, idx: usize, method: &str, params: Value) -> Result<Value> {
        let slot = &self.slots[idx];
        slot.limiter.acquire().await;

        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let started = Instant::now();
        let outcome = self.post_rpc(&slot.config, &body).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(value) => {
                let mut health = slot.health.write().await;
                health.on_success(
                    latency_ms,
                    self.cfg.degraded_latency_ms,
                    self.cfg.healthy_latency_ms,
                );
                Ok(value)
            }
            Err(err) => {
                if err.is_connection_error() {
                    let mut health = slot.health.write().await;
                    health.on_failure(Utc::now(), self.cfg.recovery_time_secs);
                    if health.status == ProviderStatus::CircuitOpen {
                        warn!(
                            chain = self.chain.chain_id,
                            provider = %slot.config.name,
                            "Provider circuit opened for {}s",
                            self.cfg.recovery_time_secs
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn post_rpc(&self, provider: &RpcProviderConfig, body: &Value) -> Result<Value> {
        let response = self.http.post(&provider.http_url).json(body).send().await?;

        if response.status().as_u16() == 429 {
            return Err(Error::RpcRateLimited(provider.name.clone()));
        }
        if !response.status().is_success() {
            return Err(Error::RpcConnection(format!(
                "{}: HTTP {}",
                provider.name,
                response.status()
            )));
        }

        let parsed: Value = response.json().await?;
        if let Some(err) = parsed.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            // Semantic errors (invalid filter, revert data) are not
            // connection failures and must not demote the provider.
            return Err(Error::Rpc(message));
        }

        parsed
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Rpc("response missing result".into()))
    }

    /// Execute a call with up to three attempts, re-selecting the best
    /// provider before each.
    pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
        let mut last_err = Error::NoHealthyProvider(self.chain.chain_id);

        for (attempt, backoff_ms) in FAILOVER_BACKOFF_MS.iter().enumerate() {
            let idx = match self.select_best().await {
                Ok(idx) => idx,
                Err(e) => {
                    last_err = e;
                    tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                    continue;
                }
            };

            match self.dispatch(idx, method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!(
                        chain = self.chain.chain_id,
                        provider = %self.slots[idx].config.name,
                        attempt,
                        error = %e,
                        "RPC attempt failed, failing over"
                    );
                    self.failover_count.fetch_add(1, Ordering::Relaxed);
                    last_err = e;
                    tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    // --- Typed JSON-RPC wrappers ---

    pub async fn block_number(&self) -> Result<u64> {
        let value = self.execute("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }

    pub async fn get_block_by_number(&self, number: u64) -> Result<Value> {
        self.execute("eth_getBlockByNumber", json!([to_hex(number), false]))
            .await
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let value = self.execute("eth_getLogs", json!([filter.to_params()])).await?;
        serde_json::from_value(value).map_err(Error::from)
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        let value = self
            .execute("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_u256(&value)
    }

    pub async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        let value = self
            .execute("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_quantity(&value)
    }

    pub async fn call(&self, request: &CallRequest) -> Result<Bytes> {
        let value = self.execute("eth_call", json!([request, "latest"])).await?;
        let hex_str = value
            .as_str()
            .ok_or_else(|| Error::Rpc("eth_call returned non-string".into()))?;
        hex_str
            .parse::<Bytes>()
            .map_err(|e| Error::Rpc(format!("bad call result: {e}")))
    }

    pub async fn estimate_gas(&self, request: &CallRequest) -> Result<U256> {
        let value = self.execute("eth_estimateGas", json!([request])).await?;
        parse_u256(&value)
    }

    pub async fn gas_price(&self) -> Result<U256> {
        let value = self.execute("eth_gasPrice", json!([])).await?;
        parse_u256(&value)
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let value = self
            .execute("eth_sendRawTransaction", json!([raw]))
            .await
            .map_err(|e| match e {
                // Send failures are their own class so the executor can
                // retry transient ones.
                Error::Rpc(msg) => Error::TransactionSend(msg),
                other => other,
            })?;
        serde_json::from_value(value).map_err(Error::from)
    }

    pub async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        let value = self
            .execute("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some).map_err(Error::from)
    }

    // --- Health monitoring ---

    /// Probe every provider with a cheap call and update its health.
    /// Runs on `health_check_interval` from the engine root.
    pub async fn run_health_checks(&self) {
        for slot in &self.slots {
            {
                let health = slot.health.read().await;
                if health.is_circuit_open(Utc::now()) {
                    continue;
                }
            }

            let body = json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "eth_blockNumber",
                "params": [],
            });
            let started = Instant::now();
            let outcome = self.post_rpc(&slot.config, &body).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let mut health = slot.health.write().await;
            match outcome {
                Ok(_) => health.on_success(
                    latency_ms,
                    self.cfg.degraded_latency_ms,
                    self.cfg.healthy_latency_ms,
                ),
                Err(e) => {
                    debug!(
                        chain = self.chain.chain_id,
                        provider = %slot.config.name,
                        error = %e,
                        "Health probe failed"
                    );
                    health.on_failure(Utc::now(), self.cfg.recovery_time_secs);
                }
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.health_check_interval_secs)
    }

    pub async fn health_summary(&self) -> Vec<ProviderSnapshot> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let health = slot.health.read().await;
            out.push(ProviderSnapshot {
                name: slot.config.name.clone(),
                status: health.status,
                average_latency_ms: health.metrics.average_latency_ms,
                success_rate: health.metrics.success_rate(),
                consecutive_failures: health.metrics.consecutive_failures,
            });
        }
        out
    }

    pub fn failover_count(&self) -> u64 {
        self.failover_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) async fn force_failures(&self, provider_idx: usize, count: u32) {
        let mut health = self.slots[provider_idx].health.write().await;
        for _ in 0..count {
            health.on_failure(Utc::now(), self.cfg.recovery_time_secs);
        }
    }

    #[cfg(test)]
    pub(crate) async fn provider_status(&self, provider_idx: usize) -> ProviderStatus {
        self.slots[provider_idx].health.read().await.status
    }

    #[cfg(test)]
    pub(crate) async fn selected_provider_name(&self) -> Result<String> {
        let idx = self.select_best().await?;
        Ok(self.slots[idx].config.name.clone())
    }
}

pub fn to_hex(value: u64) -> String {
    format!("{value:#x}")
}

fn parse_quantity(value: &Value) -> Result<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::Rpc("expected hex quantity".into()))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Rpc(format!("bad quantity {s}: {e}")))
}

fn parse_u256(value: &Value) -> Result<U256> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::Rpc("expected hex quantity".into()))?;
    U256::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Rpc(format!("bad quantity {s}: {e}")))
}
