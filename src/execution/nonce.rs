//! Nonce management
//!
//! Issues strictly monotonic nonces per wallet, synced from the chain on
//! first use. Pending nonces older than the stuck timeout are surfaced for
//! replacement-by-fee; after three replacement attempts the nonce is
//! reported stuck.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::provider::ProviderManager;

/// Replacement attempts before a nonce is declared stuck
pub const MAX_REPLACEMENTS: u32 = 3;

#[derive(Debug, Clone)]
struct PendingNonce {
    issued_at: DateTime<Utc>,
    replacements: u32,
}

#[derive(Debug, Default)]
struct WalletState {
    next: u64,
    synced: bool,
    pending: BTreeMap<u64, PendingNonce>,
}

/// A nonce due for replacement-by-fee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckNonce {
    pub wallet: Address,
    pub nonce: u64,
    pub replacements: u32,
}

pub struct NonceManager {
    providers: Arc<ProviderManager>,
    stuck_timeout: Duration,
    wallets: Mutex<std::collections::HashMap<Address, WalletState>>,
}

impl NonceManager {
    pub fn new(providers: Arc<ProviderManager>, stuck_timeout_secs: u64) -> Self {
        Self {
            providers,
            stuck_timeout: Duration::seconds(stuck_timeout_secs as i64),
            wallets: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Reserve the next nonce for a wallet. First use syncs from the
    /// chain's pending count; afterwards the local counter is
    /// authoritative and strictly monotonic.
    pub async fn reserve(&self, wallet: Address) -> Result<u64> {
        let mut wallets = self.wallets.lock().await;
        let state = wallets.entry(wallet).or_default();

        if !state.synced {
            drop(wallets);
            let chain_nonce = self.providers.get_transaction_count(wallet).await?;
            let mut wallets = self.wallets.lock().await;
            let state = wallets.entry(wallet).or_default();
            if !state.synced {
                state.next = state.next.max(chain_nonce);
                state.synced = true;
            }
            let nonce = state.next;
            state.next += 1;
            state.pending.insert(
                nonce,
                PendingNonce {
                    issued_at: Utc::now(),
                    replacements: 0,
                },
            );
            debug!(wallet = %wallet, nonce, "Nonce reserved (chain-synced)");
            return Ok(nonce);
        }

        let nonce = state.next;
        state.next += 1;
        state.pending.insert(
            nonce,
            PendingNonce {
                issued_at: Utc::now(),
                replacements: 0,
            },
        );
        debug!(wallet = %wallet, nonce, "Nonce reserved");
        Ok(nonce)
    }

    /// Mark a nonce as landed (or permanently abandoned).
    pub async fn complete(&self, wallet: Address, nonce: u64) {
        let mut wallets = self.wallets.lock().await;
        if let Some(state) = wallets.get_mut(&wallet) {
            state.pending.remove(&nonce);
        }
    }

    /// Pending nonces older than the stuck timeout, oldest first.
    /// Each call counts as one replacement attempt for the reported
    /// nonces; a nonce past `MAX_REPLACEMENTS` returns an error instead.
    pub async fn stuck_nonces(&self) -> Result<Vec<StuckNonce>> {
        let cutoff = Utc::now() - self.stuck_timeout;
        let mut wallets = self.wallets.lock().await;
        let mut out = Vec::new();

        for (wallet, state) in wallets.iter_mut() {
            // Only the oldest gap matters; later nonces cannot land first.
            if let Some((&nonce, pending)) = state.pending.iter_mut().next() {
                if pending.issued_at < cutoff {
                    if pending.replacements >= MAX_REPLACEMENTS {
                        warn!(wallet = %wallet, nonce, "Nonce stuck beyond replacement budget");
                        return Err(Error::StuckNonce {
                            wallet: format!("{wallet:#x}"),
                            nonce,
                            attempts: pending.replacements,
                        });
                    }
                    pending.replacements += 1;
                    pending.issued_at = Utc::now();
                    out.push(StuckNonce {
                        wallet: *wallet,
                        nonce,
                        replacements: pending.replacements,
                    });
                }
            }
        }

        Ok(out)
    }

    pub async fn pending_count(&self, wallet: Address) -> usize {
        self.wallets
            .lock()
            .await
            .get(&wallet)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) async fn force_synced(&self, wallet: Address, next: u64) {
        let mut wallets = self.wallets.lock().await;
        let state = wallets.entry(wallet).or_default();
        state.next = next;
        state.synced = true;
    }

    #[cfg(test)]
    pub(crate) async fn age_pending(&self, wallet: Address, nonce: u64, seconds: i64) {
        let mut wallets = self.wallets.lock().await;
        if let Some(p) = wallets
            .get_mut(&wallet)
            .and_then(|s| s.pending.get_mut(&nonce))
        {
            p.issued_at = Utc::now() - Duration::seconds(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainRegistry;
    use crate::config::ProviderConfig;

    fn manager() -> NonceManager {
        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        let chain = Arc::new(registry.get(1).unwrap().clone());
        let providers =
            Arc::new(ProviderManager::new(chain, ProviderConfig::default()).unwrap());
        NonceManager::new(providers, 90)
    }

    #[tokio::test]
    async fn test_monotonic_issue() {
        let m = manager();
        let wallet = Address::random();
        m.force_synced(wallet, 10).await;

        assert_eq!(m.reserve(wallet).await.unwrap(), 10);
        assert_eq!(m.reserve(wallet).await.unwrap(), 11);
        assert_eq!(m.reserve(wallet).await.unwrap(), 12);
        assert_eq!(m.pending_count(wallet).await, 3);
    }

    #[tokio::test]
    async fn test_complete_clears_pending() {
        let m = manager();
        let wallet = Address::random();
        m.force_synced(wallet, 0).await;

        let n = m.reserve(wallet).await.unwrap();
        m.complete(wallet, n).await;
        assert_eq!(m.pending_count(wallet).await, 0);
    }

    #[tokio::test]
    async fn test_fresh_nonces_not_stuck() {
        let m = manager();
        let wallet = Address::random();
        m.force_synced(wallet, 0).await;
        m.reserve(wallet).await.unwrap();

        assert!(m.stuck_nonces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aged_nonce_reported_with_attempts() {
        let m = manager();
        let wallet = Address::random();
        m.force_synced(wallet, 5).await;
        let n = m.reserve(wallet).await.unwrap();
        m.age_pending(wallet, n, 120).await;

        let stuck = m.stuck_nonces().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].nonce, 5);
        assert_eq!(stuck[0].replacements, 1);

        // Immediately afterwards the clock was reset, so not stuck again.
        assert!(m.stuck_nonces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replacement_budget_exhaustion() {
        let m = manager();
        let wallet = Address::random();
        m.force_synced(wallet, 0).await;
        let n = m.reserve(wallet).await.unwrap();

        for _ in 0..MAX_REPLACEMENTS {
            m.age_pending(wallet, n, 120).await;
            assert!(!m.stuck_nonces().await.unwrap().is_empty());
        }

        m.age_pending(wallet, n, 120).await;
        let err = m.stuck_nonces().await.unwrap_err();
        assert!(matches!(err, Error::StuckNonce { nonce: 0, .. }));
    }

    #[tokio::test]
    async fn test_only_oldest_gap_reported() {
        let m = manager();
        let wallet = Address::random();
        m.force_synced(wallet, 0).await;
        let first = m.reserve(wallet).await.unwrap();
        let second = m.reserve(wallet).await.unwrap();
        m.age_pending(wallet, first, 120).await;
        m.age_pending(wallet, second, 120).await;

        let stuck = m.stuck_nonces().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].nonce, first);
    }
}
