//! Domain event bus
//!
//! Ordered per-topic pub/sub used to decouple the discovery, risk, decision
//! and execution stages. Every message carries a correlation id for
//! cross-component tracing; delivery is at-least-once, so subscribers must
//! be idempotent on that id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Schema version stamped into every envelope
pub const SCHEMA_VERSION: u32 = 1;

/// Well-known topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "pairs.new")]
    PairsNew,
    #[serde(rename = "risk.assessment")]
    RiskAssessment,
    #[serde(rename = "decisions.trading")]
    DecisionsTrading,
    #[serde(rename = "executions.result")]
    ExecutionsResult,
    #[serde(rename = "engine.status")]
    EngineStatus,
    #[serde(rename = "alerts.triggered")]
    AlertsTriggered,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PairsNew => "pairs.new",
            Topic::RiskAssessment => "risk.assessment",
            Topic::DecisionsTrading => "decisions.trading",
            Topic::ExecutionsResult => "executions.result",
            Topic::EngineStatus => "engine.status",
            Topic::AlertsTriggered => "alerts.triggered",
        }
    }

    fn all() -> [Topic; 6] {
        [
            Topic::PairsNew,
            Topic::RiskAssessment,
            Topic::DecisionsTrading,
            Topic::ExecutionsResult,
            Topic::EngineStatus,
            Topic::AlertsTriggered,
        ]
    }
}

/// Envelope around every published payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Uuid,
    pub produced_at: DateTime<Utc>,
    pub schema: u32,
    pub topic: Topic,
    /// Self-describing JSON payload
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(topic: Topic, correlation_id: Uuid, payload: &T) -> Result<Self> {
        Ok(Self {
            correlation_id,
            produced_at: Utc::now(),
            schema: SCHEMA_VERSION,
            topic,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a concrete event type
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(Error::from)
    }
}

/// Per-topic broadcast bus
pub struct EventBus {
    channels: HashMap<Topic, broadcast::Sender<Envelope>>,
    published: AtomicU64,
    lagged: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let mut channels = HashMap::new();
        for topic in Topic::all() {
            let (tx, _rx) = broadcast::channel(capacity);
            channels.insert(topic, tx);
        }
        Arc::new(Self {
            channels,
            published: AtomicU64::new(0),
            lagged: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Publish a payload to a topic under a fresh correlation id
    pub fn publish<T: Serialize>(&self, topic: Topic, payload: &T) -> Result<Uuid> {
        self.publish_correlated(topic, Uuid::new_v4(), payload)
    }

    /// Publish a payload continuing an existing correlation chain
    pub fn publish_correlated<T: Serialize>(
        &self,
        topic: Topic,
        correlation_id: Uuid,
        payload: &T,
    ) -> Result<Uuid> {
        let envelope = Envelope::new(topic, correlation_id, payload)?;
        let tx = self
            .channels
            .get(&topic)
            .expect("all topics registered at construction");

        // A send error just means no subscriber is listening yet; the
        // published counter still advances so gaps are visible.
        let _ = tx.send(envelope);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(correlation_id)
    }

    /// Subscribe to a topic. Receivers that fall behind see `Lagged` and
    /// the bus counts the missed messages; drops are never silent.
    pub fn subscribe(&self, topic: Topic) -> BusSubscription {
        let tx = self
            .channels
            .get(&topic)
            .expect("all topics registered at construction");
        BusSubscription {
            topic,
            rx: tx.subscribe(),
            lagged: Arc::clone(&self.lagged),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn lagged_count(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

/// A live subscription to one topic
pub struct BusSubscription {
    pub topic: Topic,
    rx: broadcast::Receiver<Envelope>,
    lagged: Arc<AtomicU64>,
}

impl BusSubscription {
    /// Receive the next envelope, transparently skipping over lag gaps
    /// (which are counted and logged).
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.lagged.fetch_add(missed, Ordering::Relaxed);
                    warn!(
                        topic = self.topic.as_str(),
                        missed, "Subscriber lagged; events dropped"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
