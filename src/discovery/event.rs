//! Discovery event types

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

/// Unique identity of a liquidity pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId {
    pub chain_id: u64,
    pub token0: Address,
    pub token1: Address,
    pub fee_tier: u32,
}

impl std::fmt::Display for PairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{:#x}-{:#x}-{}",
            self.chain_id, self.token0, self.token1, self.fee_tier
        )
    }
}

/// Enriched token metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMeta {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMeta {
    /// Fallback metadata when enrichment calls fail
    pub fn unknown(address: Address) -> Self {
        Self {
            address,
            symbol: "UNKNOWN".to_string(),
            decimals: 18,
        }
    }

    pub fn is_known(&self) -> bool {
        self.symbol != "UNKNOWN"
    }
}

/// A newly discovered trading pair with enriched metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPairEvent {
    pub pair_id: PairId,
    pub pool_address: Address,
    pub token0: TokenMeta,
    pub token1: TokenMeta,
    pub tick_spacing: i32,
    pub block_number: u64,
    pub tx_hash: H256,
    pub discovered_at: DateTime<Utc>,
    pub is_weth_pair: bool,
    pub is_stablecoin_pair: bool,
    pub discovery_latency_ms: u64,
}

impl NewPairEvent {
    pub fn chain_id(&self) -> u64 {
        self.pair_id.chain_id
    }

    /// The non-quote token of the pair, when it can be identified.
    ///
    /// For a WETH or stablecoin pair this is the other side; otherwise
    /// token0 by convention.
    pub fn target_token(&self, weth: Address, is_stable: impl Fn(&Address) -> bool) -> Address {
        let t0 = self.token0.address;
        let t1 = self.token1.address;
        if t0 == weth || is_stable(&t0) {
            t1
        } else {
            t0
        }
    }

    /// Whether this pair is worth forwarding to risk analysis.
    ///
    /// WETH and stablecoin pairs always qualify; anything else needs both
    /// symbols resolved.
    pub fn is_tradeable(&self) -> bool {
        if self.is_weth_pair || self.is_stablecoin_pair {
            return true;
        }
        self.token0.is_known() && self.token1.is_known()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pair(t0_symbol: &str, t1_symbol: &str, weth: bool, stable: bool) -> NewPairEvent {
        let t0 = Address::from_str("0x1000000000000000000000000000000000000001").unwrap();
        let t1 = Address::from_str("0x2000000000000000000000000000000000000002").unwrap();
        NewPairEvent {
            pair_id: PairId {
                chain_id: 1,
                token0: t0,
                token1: t1,
                fee_tier: 3000,
            },
            pool_address: Address::zero(),
            token0: TokenMeta {
                address: t0,
                symbol: t0_symbol.into(),
                decimals: 18,
            },
            token1: TokenMeta {
                address: t1,
                symbol: t1_symbol.into(),
                decimals: 6,
            },
            tick_spacing: 60,
            block_number: 100,
            tx_hash: H256::zero(),
            discovered_at: Utc::now(),
            is_weth_pair: weth,
            is_stablecoin_pair: stable,
            discovery_latency_ms: 42,
        }
    }

    #[test]
    fn test_weth_pair_always_tradeable() {
        let ev = pair("UNKNOWN", "UNKNOWN", true, false);
        assert!(ev.is_tradeable());
    }

    #[test]
    fn test_unknown_symbols_not_tradeable() {
        let ev = pair("UNKNOWN", "UNKNOWN", false, false);
        assert!(!ev.is_tradeable());

        let ev = pair("ABC", "UNKNOWN", false, false);
        assert!(!ev.is_tradeable());

        let ev = pair("ABC", "XYZ", false, false);
        assert!(ev.is_tradeable());
    }

    #[test]
    fn test_target_token_skips_quote_side() {
        let ev = pair("WETH", "NEW", false, false);
        let weth = ev.token0.address;
        assert_eq!(ev.target_token(weth, |_| false), ev.token1.address);

        let not_weth = Address::zero();
        assert_eq!(ev.target_token(not_weth, |_| false), ev.token0.address);
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let ev = pair("ABC", "WETH", true, false);
        let json = serde_json::to_string(&ev).unwrap();
        let back: NewPairEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pair_id, ev.pair_id);
        assert_eq!(back.token0.symbol, "ABC");
        assert_eq!(back.discovery_latency_ms, 42);
    }

    #[test]
    fn test_pair_id_display_unique_per_fee() {
        let a = pair("A", "B", false, false);
        let mut b = pair("A", "B", false, false);
        b.pair_id.fee_tier = 500;
        assert_ne!(a.pair_id.to_string(), b.pair_id.to_string());
    }
}
