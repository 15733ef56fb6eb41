//! WebSocket subscription manager
//!
//! Maintains `eth_subscribe` streams for new block headers and factory
//! logs, with keepalive pings and automatic reconnection. On reconnect the
//! manager re-selects the best provider and re-subscribes; the discovery
//! service backfills the gap from its last processed block via HTTP.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Log, H256};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::manager::ProviderManager;

/// Keepalive ping cadence
const PING_INTERVAL_SECS: u64 = 20;
/// Missing pong budget before the connection is declared dead
const PONG_TIMEOUT_SECS: u64 = 10;

/// Event delivered to the discovery service
#[derive(Debug, Clone)]
pub enum WsEvent {
    /// New chain head
    NewHead { block_number: u64 },
    /// Factory log matching the PoolCreated filter
    FactoryLog(Log),
    Connected,
    Disconnected,
}

/// WebSocket subscription manager for one chain
pub struct WsManager {
    providers: Arc<ProviderManager>,
    factory: Address,
    topic0: H256,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    event_tx: mpsc::Sender<WsEvent>,
}

impl WsManager {
    pub fn new(
        providers: Arc<ProviderManager>,
        factory: Address,
        topic0: H256,
        connect_timeout_secs: u64,
        reconnect_delay_secs: u64,
        event_tx: mpsc::Sender<WsEvent>,
    ) -> Self {
        Self {
            providers,
            factory,
            topic0,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            event_tx,
        }
    }

    /// Run the connect/stream/reconnect loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                info!(chain = self.providers.chain().chain_id, "WebSocket manager stopped");
                return;
            }

            match self.connect_and_stream(&cancel).await {
                Ok(()) => {
                    // Clean shutdown requested
                    return;
                }
                Err(e) => {
                    error!(
                        chain = self.providers.chain().chain_id,
                        error = %e,
                        "WebSocket stream error"
                    );
                }
            }

            let _ = self.event_tx.send(WsEvent::Disconnected).await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn connect_and_stream(&self, cancel: &CancellationToken) -> Result<()> {
        let ws_url = self.providers.best_ws_url().await?;
        let url = url::Url::parse(&ws_url)
            .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {e}")))?;

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                Error::WebSocketConnection(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::WebSocketConnection(format!("connect failed: {e}")))?;

        info!(chain = self.providers.chain().chain_id, "WebSocket connected");
        let _ = self.event_tx.send(WsEvent::Connected).await;

        let (mut write, mut read) = ws_stream.split();

        // Subscribe to new heads
        write
            .send(Message::Text(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "eth_subscribe",
                    "params": ["newHeads"],
                })
                .to_string(),
            ))
            .await
            .map_err(|e| Error::SubscriptionFailed(format!("newHeads: {e}")))?;

        // Subscribe to factory PoolCreated logs
        write
            .send(Message::Text(
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "eth_subscribe",
                    "params": ["logs", {
                        "address": self.factory,
                        "topics": [self.topic0],
                    }],
                })
                .to_string(),
            ))
            .await
            .map_err(|e| Error::SubscriptionFailed(format!("logs: {e}")))?;

        let mut ping_timer = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut awaiting_pong_since: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                _ = ping_timer.tick() => {
                    if let Some(since) = awaiting_pong_since {
                        if since.elapsed() > Duration::from_secs(PONG_TIMEOUT_SECS) {
                            return Err(Error::WebSocketDisconnected);
                        }
                    }
                    write
                        .send(Message::Ping(vec![]))
                        .await
                        .map_err(|_| Error::WebSocketDisconnected)?;
                    awaiting_pong_since = Some(tokio::time::Instant::now());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_message(&text).await {
                                warn!(error = %e, "Failed to handle WebSocket message");
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong_since = None;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::WebSocketDisconnected);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(Error::WebSocketConnection(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&self, text: &str) -> Result<()> {
        let value: Value = serde_json::from_str(text)?;

        // Subscription confirmations carry an id; notifications carry params.
        let Some(result) = value.pointer("/params/result") else {
            debug!(chain = self.providers.chain().chain_id, "WebSocket control message");
            return Ok(());
        };

        if let Some(number) = result.get("number").and_then(Value::as_str) {
            let block_number = u64::from_str_radix(number.trim_start_matches("0x"), 16)
                .map_err(|e| Error::LogDecode(format!("bad block number {number}: {e}")))?;
            self.event_tx
                .send(WsEvent::NewHead { block_number })
                .await
                .map_err(|_| Error::Internal("discovery channel closed".into()))?;
        } else if result.get("topics").is_some() {
            let log: Log = serde_json::from_value(result.clone())?;
            self.event_tx
                .send(WsEvent::FactoryLog(log))
                .await
                .map_err(|_| Error::Internal("discovery channel closed".into()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_notification_shape() {
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x1",
                "result": {"number": "0x1b4", "hash": "0xaa"}
            }
        }"#;
        let value: Value = serde_json::from_str(text).unwrap();
        let number = value
            .pointer("/params/result/number")
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(u64::from_str_radix(number.trim_start_matches("0x"), 16).unwrap(), 436);
    }

    #[test]
    fn test_log_notification_decodes() {
        let text = r#"{
            "params": {
                "result": {
                    "address": "0x1f98431c8ad98523631ae4a59f267346ea31f984",
                    "topics": ["0x783cca1c0412dd0d695e784568c96da2e9c22ff989357a2e8b1d9b2b4e6b7118"],
                    "data": "0x",
                    "blockNumber": "0x10",
                    "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                    "transactionIndex": "0x0",
                    "blockHash": "0x3333333333333333333333333333333333333333333333333333333333333333",
                    "logIndex": "0x0",
                    "removed": false
                }
            }
        }"#;
        let value: Value = serde_json::from_str(text).unwrap();
        let result = value.pointer("/params/result").unwrap();
        let log: Log = serde_json::from_value(result.clone()).unwrap();
        assert_eq!(log.topics.len(), 1);
        assert_eq!(log.block_number.unwrap().as_u64(), 16);
    }
}
