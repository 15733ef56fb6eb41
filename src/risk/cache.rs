//! Risk verdict cache
//!
//! Sub-50 ms lookups of prior assessments keyed by `(chain_id, token)`.
//! Entry TTLs come from the tightest contributing category (honeypot and
//! contract results live for hours, liquidity and technical results for
//! minutes). At most one build per key runs at a time; concurrent
//! requesters wait on the in-flight build instead of duplicating it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ethers::types::Address;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;

use super::types::{FastRiskView, RiskAssessment, RiskCategory};

pub type CacheKey = (u64, Address);

#[derive(Clone)]
struct CacheEntry {
    assessment: RiskAssessment,
    inserted_at: DateTime<Utc>,
    ttl_secs: u64,
    last_accessed: DateTime<Utc>,
    origin: RiskCategory,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.inserted_at + Duration::seconds(self.ttl_secs as i64)
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// TTL'd, single-flight risk assessment cache
pub struct RiskCache {
    entries: DashMap<CacheKey, CacheEntry>,
    in_flight: DashMap<CacheKey, Arc<Notify>>,
    capacity_per_category: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl RiskCache {
    pub fn new(capacity_per_category: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            capacity_per_category,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Fresh cached assessment, if any. Touches the LRU clock.
    pub fn get(&self, key: &CacheKey) -> Option<RiskAssessment> {
        let now = Utc::now();
        let mut entry = self.entries.get_mut(key)?;
        if !entry.is_fresh(now) {
            drop(entry);
            self.entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        entry.last_accessed = now;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.assessment.clone())
    }

    /// Cheap pre-trade view for the fast lane; no build is triggered.
    pub fn fast_view(&self, key: &CacheKey) -> Option<FastRiskView> {
        self.get(key).map(|a| FastRiskView::from(&a))
    }

    /// Return the cached assessment or run `build` exactly once per key.
    ///
    /// Losers of the build race wait for the winner's notify and re-read
    /// the cache; a failed build wakes the waiters, and the first of them
    /// takes over the build slot.
    pub async fn get_or_build<F, Fut>(&self, key: CacheKey, build: F) -> Result<RiskAssessment>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RiskAssessment>>,
    {
        loop {
            if let Some(found) = self.get(&key) {
                return Ok(found);
            }

            let notify = Arc::new(Notify::new());
            match self.in_flight.entry(key) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&notify));
                }
                dashmap::mapref::entry::Entry::Occupied(slot) => {
                    // Someone else is building; wait and re-check.
                    let waiter = Arc::clone(slot.get());
                    drop(slot);
                    self.coalesced.fetch_add(1, Ordering::Relaxed);

                    // Register before re-checking the slot so a
                    // notify_waiters between the two cannot be missed;
                    // the pointer comparison guards against a successor
                    // build having replaced the slot in the meantime.
                    let notified = waiter.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let still_ours = self
                        .in_flight
                        .get(&key)
                        .map(|current| Arc::ptr_eq(current.value(), &waiter))
                        .unwrap_or(false);
                    if !still_ours {
                        continue;
                    }
                    notified.await;
                    continue;
                }
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            let outcome = build().await;

            // Store before releasing the slot so waiters observe the result.
            if let Ok(assessment) = &outcome {
                self.insert(key, assessment.clone());
            }
            self.in_flight.remove(&key);
            notify.notify_waiters();

            return outcome;
        }
    }

    /// Insert an assessment, evicting the least-recently-used entry of the
    /// same origin category when that category's cap is exceeded.
    pub fn insert(&self, key: CacheKey, assessment: RiskAssessment) {
        let ttl_secs = assessment.cache_ttl_secs();
        let origin = assessment
            .categories
            .values()
            .filter(|s| s.confidence > 0.0)
            .min_by_key(|s| s.category.cache_ttl_secs())
            .map(|s| s.category)
            .unwrap_or(RiskCategory::Technical);

        let now = Utc::now();
        self.entries.insert(
            key,
            CacheEntry {
                assessment,
                inserted_at: now,
                ttl_secs,
                last_accessed: now,
                origin,
            },
        );

        self.evict_category_overflow(origin);
    }

    fn evict_category_overflow(&self, origin: RiskCategory) {
        let count = self
            .entries
            .iter()
            .filter(|e| e.value().origin == origin)
            .count();
        if count <= self.capacity_per_category {
            return;
        }

        let victim = self
            .entries
            .iter()
            .filter(|e| e.value().origin == origin)
            .min_by_key(|e| e.value().last_accessed)
            .map(|e| *e.key());

        if let Some(key) = victim {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(chain = key.0, token = %key.1, "Evicted LRU risk entry");
        }
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::types::{DataQuality, RiskCategoryScore};
    use std::sync::atomic::AtomicU32;

    fn assessment(token: Address, category: RiskCategory) -> RiskAssessment {
        RiskAssessment::aggregate(
            1,
            token,
            vec![RiskCategoryScore::new(category, 0.1, 0.9, DataQuality::Good)],
            0.8,
        )
    }

    #[tokio::test]
    async fn test_hit_after_build() {
        let cache = RiskCache::new(10);
        let token = Address::random();
        let key = (1, token);

        let built = cache
            .get_or_build(key, || async { Ok(assessment(token, RiskCategory::Honeypot)) })
            .await
            .unwrap();
        assert_eq!(built.token_address, token);

        assert!(cache.get(&key).is_some());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_builds() {
        let cache = RiskCache::new(10);
        let token = Address::random();
        let key = (1, token);
        let build_count = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let count = Arc::clone(&build_count);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build(key, || {
                        let count = Arc::clone(&count);
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok(assessment(token, RiskCategory::Honeypot))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        // At most one in-flight build per key at any time; with all eight
        // racing the same key only one build runs.
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
        assert!(cache.stats().coalesced >= 1);
    }

    #[tokio::test]
    async fn test_replay_hits_cache_until_ttl() {
        let cache = RiskCache::new(10);
        let token = Address::random();
        let key = (1, token);

        let first = cache
            .get_or_build(key, || async { Ok(assessment(token, RiskCategory::Honeypot)) })
            .await
            .unwrap();

        // Replaying the same event must return the identical assessment.
        let second = cache
            .get_or_build(key, || async { panic!("must not rebuild while fresh") })
            .await
            .unwrap();
        assert_eq!(first.assessed_at, second.assessed_at);
    }

    #[tokio::test]
    async fn test_expired_entry_rebuilds() {
        let cache = RiskCache::new(10);
        let token = Address::random();
        let key = (1, token);

        let mut stale = assessment(token, RiskCategory::Technical);
        stale.assessed_at = Utc::now();
        cache.insert(key, stale);

        // Force expiry by rewriting the entry clock.
        if let Some(mut e) = cache.entries.get_mut(&key) {
            e.inserted_at = Utc::now() - Duration::seconds(10_000);
        }

        assert!(cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_category_lru_eviction() {
        let cache = RiskCache::new(2);

        for _ in 0..3 {
            let token = Address::random();
            cache.insert((1, token), assessment(token, RiskCategory::Liquidity));
        }

        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_failed_build_propagates_and_releases_slot() {
        let cache = RiskCache::new(10);
        let token = Address::random();
        let key = (1, token);

        let err = cache
            .get_or_build(key, || async {
                Err(crate::error::Error::RiskTimeout("t".into()))
            })
            .await;
        assert!(err.is_err());

        // The slot is free again: a subsequent build succeeds.
        let ok = cache
            .get_or_build(key, || async { Ok(assessment(token, RiskCategory::Honeypot)) })
            .await;
        assert!(ok.is_ok());
    }
}
