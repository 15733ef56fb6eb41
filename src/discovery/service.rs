//! Per-chain discovery service
//!
//! Three cooperating tasks feed one processor: the WebSocket header
//! subscription advances `last_processed_block`, the factory log
//! subscription delivers `PoolCreated` events as they happen, and an HTTP
//! polling fallback rescans a lookback window behind the head for anything
//! the socket missed. Raw logs flow through a bounded queue and are drained
//! in batches.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::{Address, Bytes, Log, H256, U256};
use lazy_static::lazy_static;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chain::ChainConfig;
use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::provider::manager::{CallRequest, LogFilter};
use crate::provider::{ProviderManager, WsEvent, WsManager};

use super::event::{NewPairEvent, PairId, TokenMeta};

lazy_static! {
    /// keccak("PoolCreated(address,address,uint24,int24,address)")
    pub static ref POOL_CREATED_TOPIC: H256 = H256::from_str(
        "0x783cca1c0412dd0d695e784568c96da2e9c22ff989357a2e8b1d9b2b4e6b7118"
    )
    .expect("valid topic literal");
}

// ERC-20 metadata selectors
const SELECTOR_SYMBOL: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];
const SELECTOR_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];

/// Recently-seen pair ids, bounded FIFO
struct DedupSet {
    seen: HashSet<PairId>,
    order: VecDeque<PairId>,
    capacity: usize,
}

impl DedupSet {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true if the id was new
    fn insert(&mut self, id: PairId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Per-service counters, snapshotted into the engine status
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    pub events_processed: AtomicU64,
    pub pairs_discovered: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub failed_enrichments: AtomicU64,
}

/// Discovery service for a single chain
pub struct DiscoveryService {
    chain: Arc<ChainConfig>,
    providers: Arc<ProviderManager>,
    config: DiscoveryConfig,
    out_tx: mpsc::Sender<NewPairEvent>,
    last_processed_block: AtomicU64,
    dedup: Mutex<DedupSet>,
    pub stats: DiscoveryStats,
}

impl DiscoveryService {
    pub fn new(
        chain: Arc<ChainConfig>,
        providers: Arc<ProviderManager>,
        config: DiscoveryConfig,
        out_tx: mpsc::Sender<NewPairEvent>,
    ) -> Self {
        let dedup_capacity = config.dedup_capacity;
        Self {
            chain,
            providers,
            config,
            out_tx,
            last_processed_block: AtomicU64::new(0),
            dedup: Mutex::new(DedupSet::new(dedup_capacity)),
            stats: DiscoveryStats::default(),
        }
    }

    /// Run discovery until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let start_block = self.providers.block_number().await?;
        self.last_processed_block.store(start_block, Ordering::SeqCst);
        info!(
            chain = self.chain.chain_id,
            block = start_block,
            "Discovery starting"
        );

        // Raw events buffer: bounded at twice the batch size
        let (ws_tx, ws_rx) = mpsc::channel::<WsEvent>(self.config.event_batch_size * 2);

        let ws_manager = WsManager::new(
            Arc::clone(&self.providers),
            self.chain.factory_v3,
            *POOL_CREATED_TOPIC,
            self.config.websocket_timeout_secs,
            self.config.websocket_reconnect_delay_secs,
            ws_tx,
        );

        let ws_cancel = cancel.clone();
        let ws_task = tokio::spawn(async move { ws_manager.run(ws_cancel).await });

        let poll_service = Arc::clone(&self);
        let poll_cancel = cancel.clone();
        let poll_task = tokio::spawn(async move { poll_service.poll_loop(poll_cancel).await });

        self.process_loop(ws_rx, cancel).await;

        ws_task.abort();
        poll_task.abort();
        info!(chain = self.chain.chain_id, "Discovery stopped");
        Ok(())
    }

    /// HTTP polling fallback: rescan a lookback window behind the head.
    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.http_poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let head = match self.providers.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    debug!(chain = self.chain.chain_id, error = %e, "Poll: head fetch failed");
                    continue;
                }
            };

            let last = self.last_processed_block.load(Ordering::SeqCst);
            let from = last.saturating_sub(self.config.poll_lookback_blocks);

            let filter = LogFilter {
                from_block: Some(from),
                to_block: Some(head),
                address: Some(self.chain.factory_v3),
                topic0: Some(*POOL_CREATED_TOPIC),
            };

            match self.providers.get_logs(&filter).await {
                Ok(logs) => {
                    for log in logs {
                        // Dedup makes re-processing polled events harmless.
                        if let Err(e) = self.process_log(log).await {
                            debug!(chain = self.chain.chain_id, error = %e, "Poll log failed");
                        }
                    }
                    self.advance_block(head);
                }
                Err(e) => {
                    debug!(chain = self.chain.chain_id, error = %e, "Poll: getLogs failed");
                }
            }
        }
    }

    /// Drain WebSocket events in batches.
    async fn process_loop(&self, mut ws_rx: mpsc::Receiver<WsEvent>, cancel: CancellationToken) {
        let mut batch: Vec<Log> = Vec::with_capacity(self.config.event_batch_size);

        loop {
            batch.clear();

            // Collect up to a full batch, giving up after a short wait so
            // single events are not delayed.
            loop {
                if batch.len() >= self.config.event_batch_size {
                    break;
                }
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = ws_rx.recv() => event,
                };
                match next {
                    Some(WsEvent::NewHead { block_number }) => {
                        self.advance_block(block_number);
                        if batch.is_empty() {
                            continue;
                        }
                        break;
                    }
                    Some(WsEvent::FactoryLog(log)) => {
                        batch.push(log);
                        // Keep draining whatever is immediately available.
                        while batch.len() < self.config.event_batch_size {
                            match ws_rx.try_recv() {
                                Ok(WsEvent::FactoryLog(log)) => batch.push(log),
                                Ok(WsEvent::NewHead { block_number }) => {
                                    self.advance_block(block_number)
                                }
                                Ok(_) => {}
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                    Some(WsEvent::Connected) | Some(WsEvent::Disconnected) => continue,
                    None => return,
                }
            }

            for log in batch.drain(..) {
                if let Err(e) = self.process_log(log).await {
                    debug!(chain = self.chain.chain_id, error = %e, "Event processing failed");
                }
            }
        }
    }

    fn advance_block(&self, block_number: u64) {
        self.last_processed_block
            .fetch_max(block_number, Ordering::SeqCst);
    }

    pub fn last_block(&self) -> u64 {
        self.last_processed_block.load(Ordering::SeqCst)
    }

    /// Decode, dedup, enrich and forward one factory log.
    async fn process_log(&self, log: Log) -> Result<()> {
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);

        let (pair_id, tick_spacing, pool_address) = decode_pool_created(self.chain.chain_id, &log)?;

        {
            let mut dedup = self.dedup.lock().await;
            if !dedup.insert(pair_id) {
                self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let block_number = log
            .block_number
            .map(|n| n.as_u64())
            .unwrap_or_else(|| self.last_block());
        let tx_hash = log.transaction_hash.unwrap_or_default();

        // Enrich both tokens concurrently; each side falls back to
        // UNKNOWN/18 on failure.
        let (token0, token1) = tokio::join!(
            self.fetch_token_meta(pair_id.token0),
            self.fetch_token_meta(pair_id.token1),
        );

        let is_weth_pair =
            pair_id.token0 == self.chain.weth || pair_id.token1 == self.chain.weth;
        let is_stablecoin_pair = self.chain.is_stablecoin(&pair_id.token0)
            || self.chain.is_stablecoin(&pair_id.token1);

        let discovery_latency_ms = self.block_age_ms(block_number).await;

        let event = NewPairEvent {
            pair_id,
            pool_address,
            token0,
            token1,
            tick_spacing,
            block_number,
            tx_hash,
            discovered_at: Utc::now(),
            is_weth_pair,
            is_stablecoin_pair,
            discovery_latency_ms,
        };

        self.advance_block(block_number);
        self.stats.pairs_discovered.fetch_add(1, Ordering::Relaxed);

        info!(
            chain = self.chain.chain_id,
            pool = %pool_address,
            token0 = %event.token0.symbol,
            token1 = %event.token1.symbol,
            fee = pair_id.fee_tier,
            latency_ms = discovery_latency_ms,
            "New pair discovered"
        );

        self.out_tx
            .send(event)
            .await
            .map_err(|_| Error::Internal("discovery output channel closed".into()))
    }

    /// Milliseconds between the event's block timestamp and now.
    async fn block_age_ms(&self, block_number: u64) -> u64 {
        let Ok(block) = self.providers.get_block_by_number(block_number).await else {
            return 0;
        };
        let Some(ts_hex) = block.get("timestamp").and_then(serde_json::Value::as_str) else {
            return 0;
        };
        let Ok(ts) = u64::from_str_radix(ts_hex.trim_start_matches("0x"), 16) else {
            return 0;
        };
        let now = Utc::now().timestamp() as u64;
        now.saturating_sub(ts) * 1000
    }

    async fn fetch_token_meta(&self, token: Address) -> TokenMeta {
        let symbol_req = CallRequest {
            to: token,
            data: Some(Bytes::from(SELECTOR_SYMBOL.to_vec())),
            ..Default::default()
        };
        let decimals_req = CallRequest {
            to: token,
            data: Some(Bytes::from(SELECTOR_DECIMALS.to_vec())),
            ..Default::default()
        };

        let (symbol_res, decimals_res) = tokio::join!(
            self.providers.call(&symbol_req),
            self.providers.call(&decimals_req),
        );

        let symbol = symbol_res.ok().and_then(|b| decode_string_return(&b));
        let decimals = decimals_res.ok().and_then(|b| decode_u8_return(&b));

        if symbol.is_none() && decimals.is_none() {
            self.stats.failed_enrichments.fetch_add(1, Ordering::Relaxed);
            return TokenMeta::unknown(token);
        }

        TokenMeta {
            address: token,
            symbol: symbol.unwrap_or_else(|| "UNKNOWN".to_string()),
            decimals: decimals.unwrap_or(18),
        }
    }
}

/// Decode a `PoolCreated(address,address,uint24,int24,address)` log.
///
/// token0, token1 and fee are indexed topics; tickSpacing and pool sit in
/// the data segment.
pub fn decode_pool_created(chain_id: u64, log: &Log) -> Result<(PairId, i32, Address)> {
    if log.topics.len() != 4 || log.topics[0] != *POOL_CREATED_TOPIC {
        return Err(Error::LogDecode(format!(
            "unexpected topics ({}) for PoolCreated",
            log.topics.len()
        )));
    }
    if log.data.len() < 64 {
        return Err(Error::LogDecode(format!(
            "PoolCreated data too short: {} bytes",
            log.data.len()
        )));
    }

    let token0 = Address::from(log.topics[1]);
    let token1 = Address::from(log.topics[2]);
    let fee_tier = U256::from_big_endian(log.topics[3].as_bytes()).low_u32();

    // int24 is sign-extended into its 32-byte word
    let tick_word = U256::from_big_endian(&log.data[0..32]);
    let tick_spacing = tick_word.low_u32() as i32;
    let pool = Address::from_slice(&log.data[44..64]);

    Ok((
        PairId {
            chain_id,
            token0,
            token1,
            fee_tier,
        },
        tick_spacing,
        pool,
    ))
}

/// Decode an ABI-encoded `string` return, tolerating legacy bytes32
/// symbols.
fn decode_string_return(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        return None;
    }

    if data.len() >= 64 {
        let offset = U256::from_big_endian(&data[0..32]).low_u64() as usize;
        if offset.saturating_add(32) <= data.len() {
            let len = U256::from_big_endian(&data[offset..offset + 32]).low_u64() as usize;
            if offset + 32 + len <= data.len() && len <= 64 {
                let raw = &data[offset + 32..offset + 32 + len];
                let s = String::from_utf8_lossy(raw).trim_matches(char::from(0)).to_string();
                if !s.is_empty() {
                    return Some(s);
                }
            }
        }
    }

    // Legacy tokens return a right-padded bytes32
    if data.len() == 32 {
        let s = String::from_utf8_lossy(data)
            .trim_matches(char::from(0))
            .to_string();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return Some(s);
        }
    }

    None
}

fn decode_u8_return(data: &[u8]) -> Option<u8> {
    if data.len() < 32 {
        return None;
    }
    Some(U256::from_big_endian(&data[0..32]).low_u32() as u8)
}
