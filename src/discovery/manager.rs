//! Multi-chain discovery manager
//!
//! Fans in events from every per-chain discovery service, drops pairs that
//! are not worth analyzing, enforces the hourly rate cap and publishes the
//! survivors on the event bus.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{EventBus, Topic};
use crate::config::DiscoveryConfig;

use super::event::NewPairEvent;

/// Sliding one-hour window of delivery timestamps
struct RateWindow {
    deliveries: VecDeque<DateTime<Utc>>,
    cap: u32,
}

impl RateWindow {
    fn new(cap: u32) -> Self {
        Self {
            deliveries: VecDeque::new(),
            cap,
        }
    }

    fn try_admit(&mut self, now: DateTime<Utc>) -> bool {
        let cutoff = now - Duration::hours(1);
        while self
            .deliveries
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            self.deliveries.pop_front();
        }

        if self.deliveries.len() >= self.cap as usize {
            return false;
        }
        self.deliveries.push_back(now);
        true
    }
}

/// Delivery counters for the status snapshot
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub delivered: AtomicU64,
    pub filtered_not_tradeable: AtomicU64,
    pub rate_limited: AtomicU64,
}

/// Fans discovered pairs from all chains into the event bus
pub struct DiscoveryManager {
    bus: Arc<EventBus>,
    rate_window: Mutex<RateWindow>,
    pub stats: ManagerStats,
}

impl DiscoveryManager {
    pub fn new(bus: Arc<EventBus>, config: &DiscoveryConfig) -> Self {
        Self {
            bus,
            rate_window: Mutex::new(RateWindow::new(config.max_pairs_per_hour)),
            stats: ManagerStats::default(),
        }
    }

    /// Drain the shared event channel until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<NewPairEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            self.handle(event).await;
        }
    }

    async fn handle(&self, event: NewPairEvent) {
        if !event.is_tradeable() {
            self.stats
                .filtered_not_tradeable
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                chain = event.chain_id(),
                pool = %event.pool_address,
                "Dropping non-tradeable pair (no resolvable symbols)"
            );
            return;
        }

        {
            let mut window = self.rate_window.lock().await;
            if !window.try_admit(Utc::now()) {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                debug!(
                    chain = event.chain_id(),
                    pool = %event.pool_address,
                    "Pair rate cap reached; dropping"
                );
                return;
            }
        }

        match self.bus.publish(Topic::PairsNew, &event) {
            Ok(correlation_id) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                info!(
                    chain = event.chain_id(),
                    pool = %event.pool_address,
                    correlation = %correlation_id,
                    "Pair delivered to risk pipeline"
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to publish pair event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::event::{PairId, TokenMeta};
    use ethers::types::{Address, H256};

    fn event(tradeable: bool) -> NewPairEvent {
        let t0 = Address::random();
        let t1 = Address::random();
        NewPairEvent {
            pair_id: PairId {
                chain_id: 1,
                token0: t0,
                token1: t1,
                fee_tier: 3000,
            },
            pool_address: Address::random(),
            token0: TokenMeta {
                address: t0,
                symbol: if tradeable { "AAA".into() } else { "UNKNOWN".into() },
                decimals: 18,
            },
            token1: TokenMeta {
                address: t1,
                symbol: if tradeable { "BBB".into() } else { "UNKNOWN".into() },
                decimals: 18,
            },
            tick_spacing: 60,
            block_number: 1,
            tx_hash: H256::zero(),
            discovered_at: Utc::now(),
            is_weth_pair: false,
            is_stablecoin_pair: false,
            discovery_latency_ms: 10,
        }
    }

    #[test]
    fn test_rate_window_caps_and_slides() {
        let mut window = RateWindow::new(2);
        let now = Utc::now();

        assert!(window.try_admit(now));
        assert!(window.try_admit(now));
        assert!(!window.try_admit(now));

        // An hour later the window has slid clear.
        assert!(window.try_admit(now + Duration::hours(1) + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_non_tradeable_filtered() {
        let bus = EventBus::new(16);
        let config = DiscoveryConfig::default();
        let manager = DiscoveryManager::new(Arc::clone(&bus), &config);

        manager.handle(event(false)).await;
        assert_eq!(manager.stats.filtered_not_tradeable.load(Ordering::Relaxed), 1);
        assert_eq!(manager.stats.delivered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_tradeable_published_with_correlation() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(Topic::PairsNew);
        let config = DiscoveryConfig::default();
        let manager = DiscoveryManager::new(Arc::clone(&bus), &config);

        manager.handle(event(true)).await;

        let envelope = sub.recv().await.unwrap();
        let decoded: NewPairEvent = envelope.decode().unwrap();
        assert_eq!(decoded.token0.symbol, "AAA");
        assert_eq!(manager.stats.delivered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_rate_cap_counts_drops() {
        let bus = EventBus::new(16);
        let mut config = DiscoveryConfig::default();
        config.max_pairs_per_hour = 1;
        let manager = DiscoveryManager::new(Arc::clone(&bus), &config);

        manager.handle(event(true)).await;
        manager.handle(event(true)).await;

        assert_eq!(manager.stats.delivered.load(Ordering::Relaxed), 1);
        assert_eq!(manager.stats.rate_limited.load(Ordering::Relaxed), 1);
    }
}
