//! Private relay client
//!
//! Submits transaction bundles to an MEV-protecting relay when the chain
//! supports one and the trade warrants it, tracks inclusion across the
//! bundle window, and reports expiry so the executor can fall back to the
//! public mempool with bumped gas (one shot).

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use ethers::types::{Bytes, H256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::chain::ChainConfig;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::execution::types::TradePriority;
use crate::provider::ProviderManager;

/// MEV exposure signals considered at routing time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MevSignals {
    /// Density of recent sandwich patterns around the token, [0, 1]
    pub sandwich_density: f64,
    /// Volume-spike + coordinated-trading score from market analysis
    pub coordination_score: f64,
    /// Competing pending transactions detected for the same pool
    pub pending_competition: f64,
}

impl MevSignals {
    /// Combined MEV risk estimate in [0, 1]
    pub fn risk_score(&self) -> f64 {
        (0.5 * self.sandwich_density
            + 0.3 * self.coordination_score
            + 0.2 * self.pending_competition)
            .clamp(0.0, 1.0)
    }
}

/// Where a transaction should be published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    PrivateRelay,
    PublicMempool,
}

/// Receipt for a submitted bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleReceipt {
    pub bundle_id: String,
    pub target_block: u64,
    pub window_blocks: u64,
    pub submitted_at: DateTime<Utc>,
}

/// Terminal state of a tracked bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleStatus {
    Included { tx_hash: H256, block: u64 },
    Expired,
}

pub struct RelayClient {
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
    config: RelayConfig,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(
        chain: Arc<ChainConfig>,
        providers: Arc<ProviderManager>,
        config: RelayConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("relay http client: {e}")))?;

        Ok(Self {
            chain,
            providers,
            config,
            http,
        })
    }

    /// Gas bump applied when a bundle expires and the transaction falls
    /// back to the public mempool.
    pub fn fallback_gas_bump_percent(&self) -> u64 {
        self.config.fallback_gas_bump_percent
    }

    /// Private relay iff the chain supports one AND the trade is exposed:
    /// estimated MEV risk at/above threshold, or high/urgent priority.
    pub fn decide_route(&self, priority: TradePriority, signals: &MevSignals) -> Route {
        if !self.config.enabled || !self.chain.supports_relay() {
            return Route::PublicMempool;
        }

        let exposed = signals.risk_score() >= self.config.mev_risk_threshold
            || priority >= TradePriority::High;

        if exposed {
            Route::PrivateRelay
        } else {
            Route::PublicMempool
        }
    }

    /// Submit signed transactions as a bundle targeting `target_block`.
    pub async fn submit_bundle(
        &self,
        signed_txs: &[Bytes],
        target_block: u64,
    ) -> Result<BundleReceipt> {
        let relay_url = self
            .chain
            .relay_url
            .as_ref()
            .ok_or_else(|| Error::BundleSubmission("chain has no relay".into()))?;

        if signed_txs.is_empty() {
            return Err(Error::BundleSubmission("empty bundle".into()));
        }

        let txs: Vec<String> = signed_txs
            .iter()
            .map(|raw| format!("0x{}", hex::encode(raw)))
            .collect();
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendBundle",
            "params": [{
                "txs": txs,
                "blockNumber": format!("{target_block:#x}"),
            }],
        });

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(200),
            max_elapsed_time: Some(Duration::from_millis(self.config.request_timeout_ms)),
            ..Default::default()
        };

        let response = backoff::future::retry(backoff, || async {
            match self.post_bundle(relay_url, &body).await {
                Ok(v) => Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Retryable relay error");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await?;

        let bundle_id = response
            .get("result")
            .and_then(|r| r.get("bundleHash"))
            .and_then(|h| h.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("bundle-{target_block}"));

        info!(
            chain = self.chain.chain_id,
            bundle = %bundle_id,
            target_block,
            "Bundle submitted"
        );

        Ok(BundleReceipt {
            bundle_id,
            target_block,
            window_blocks: self.config.bundle_window_blocks,
            submitted_at: Utc::now(),
        })
    }

    async fn post_bundle(&self, url: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self.http.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(Error::BundleSubmission(format!(
                "relay returned HTTP {}",
                response.status()
            )));
        }
        let value: serde_json::Value = response.json().await?;
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown");
            return Err(Error::BundleRejected(message.to_string()));
        }
        Ok(value)
    }

    /// Track a bundle until its transaction lands or the window expires.
    pub async fn track_inclusion(
        &self,
        receipt: &BundleReceipt,
        tx_hash: H256,
    ) -> Result<BundleStatus> {
        let expiry_block = receipt.target_block + receipt.window_blocks;
        let poll = Duration::from_millis(self.chain.block_time_ms.max(250));

        loop {
            if let Some(included) = self.providers.get_transaction_receipt(tx_hash).await? {
                let block = included
                    .block_number
                    .map(|b| b.as_u64())
                    .unwrap_or(receipt.target_block);
                debug!(bundle = %receipt.bundle_id, block, "Bundle included");
                return Ok(BundleStatus::Included { tx_hash, block });
            }

            let head = self.providers.block_number().await?;
            if head > expiry_block {
                warn!(
                    bundle = %receipt.bundle_id,
                    target = receipt.target_block,
                    head,
                    "Bundle window expired without inclusion"
                );
                return Ok(BundleStatus::Expired);
            }

            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRegistry;
    use crate::config::ProviderConfig;

    fn client(chain_id: u64) -> RelayClient {
        let registry = ChainRegistry::for_chains(&[chain_id], false).unwrap();
        let chain = Arc::new(registry.get(chain_id).unwrap().clone());
        let providers = Arc::new(
            ProviderManager::new(Arc::clone(&chain), ProviderConfig::default()).unwrap(),
        );
        RelayClient::new(chain, providers, RelayConfig::default()).unwrap()
    }

    #[test]
    fn test_mev_risk_combination() {
        let none = MevSignals::default();
        assert_eq!(none.risk_score(), 0.0);

        let hot = MevSignals {
            sandwich_density: 1.0,
            coordination_score: 1.0,
            pending_competition: 1.0,
        };
        assert_eq!(hot.risk_score(), 1.0);

        let sandwiches_only = MevSignals {
            sandwich_density: 0.8,
            ..Default::default()
        };
        assert!((sandwiches_only.risk_score() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_route_high_priority_goes_private() {
        let c = client(1); // ethereum has a relay
        let calm = MevSignals::default();
        assert_eq!(
            c.decide_route(TradePriority::High, &calm),
            Route::PrivateRelay
        );
        assert_eq!(
            c.decide_route(TradePriority::Urgent, &calm),
            Route::PrivateRelay
        );
        assert_eq!(
            c.decide_route(TradePriority::Standard, &calm),
            Route::PublicMempool
        );
    }

    #[test]
    fn test_route_mev_risk_goes_private() {
        let c = client(1);
        let hot = MevSignals {
            sandwich_density: 0.9,
            coordination_score: 0.8,
            pending_competition: 0.5,
        };
        assert_eq!(
            c.decide_route(TradePriority::Standard, &hot),
            Route::PrivateRelay
        );
    }

    #[test]
    fn test_route_no_relay_chain_is_public() {
        let c = client(8453); // base has no relay configured
        let hot = MevSignals {
            sandwich_density: 1.0,
            coordination_score: 1.0,
            pending_competition: 1.0,
        };
        assert_eq!(
            c.decide_route(TradePriority::Urgent, &hot),
            Route::PublicMempool
        );
    }

    #[tokio::test]
    async fn test_empty_bundle_rejected() {
        let c = client(1);
        let err = c.submit_bundle(&[], 100).await.unwrap_err();
        assert!(matches!(err, Error::BundleSubmission(_)));
    }
}
