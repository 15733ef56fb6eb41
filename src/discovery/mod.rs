//! New-pair discovery
//!
//! Subscribes to factory `PoolCreated` events per chain (WebSocket with an
//! HTTP polling fallback), enriches them with token metadata, deduplicates
//! by pair id and delivers tradeable events to the risk pipeline.

pub mod event;
pub mod manager;
pub mod service;

pub use event::{NewPairEvent, PairId, TokenMeta};
pub use manager::DiscoveryManager;
pub use service::{DiscoveryService, POOL_CREATED_TOPIC};
