//! Token-bucket rate limiting
//!
//! Every outbound RPC call acquires a token for its provider before
//! dispatch, serializing bursts to the endpoint's configured budget.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Async token bucket
pub struct TokenBucket {
    max_rps: u32,
    burst: u32,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(max_rps: u32) -> Self {
        let burst = (2 * max_rps).min(100);
        Self {
            max_rps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Acquire one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until one token accrues
                Duration::from_secs_f64((1.0 - state.tokens) / self.max_rps as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Try to acquire without waiting
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.max_rps as f64).min(self.burst as f64);
        state.last_refill = now;
    }
}
