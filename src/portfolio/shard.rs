//! Per-chain position shard
//!
//! Each chain's positions are owned by exactly one shard; mutations are
//! serialized through its lock while readers take cloned snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::Address;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::position::{ExitCheck, Position};

pub struct ChainShard {
    chain_id: u64,
    positions: RwLock<HashMap<Uuid, Position>>,
}

impl ChainShard {
    pub fn new(chain_id: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            positions: RwLock::new(HashMap::new()),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn open(&self, position: Position) -> Uuid {
        let id = position.position_id;
        info!(
            chain = self.chain_id,
            token = %position.token_address,
            value = %position.initial_value_usd,
            "Position opened"
        );
        self.positions.write().await.insert(id, position);
        id
    }

    /// Close a position at the given price; returns realized P&L.
    pub async fn close(&self, position_id: Uuid, exit_price_usd: Decimal) -> Result<(Position, Decimal)> {
        let mut positions = self.positions.write().await;
        let mut position = positions
            .remove(&position_id)
            .ok_or_else(|| Error::PositionNotFound(position_id.to_string()))?;

        position.current_price_usd = exit_price_usd;
        let realized = position.unrealized_pnl();
        info!(
            chain = self.chain_id,
            token = %position.token_address,
            pnl = %realized,
            "Position closed"
        );
        Ok((position, realized))
    }

    /// Fan a price update out to every position in the token; returns the
    /// positions whose stop or target fired.
    pub async fn update_price(&self, token: Address, price_usd: Decimal) -> Vec<(Position, ExitCheck)> {
        let mut positions = self.positions.write().await;
        let mut triggered = Vec::new();

        for position in positions.values_mut() {
            if position.token_address != token {
                continue;
            }
            let check = position.update_price(price_usd);
            if check != ExitCheck::None {
                triggered.push((position.clone(), check));
            }
        }
        triggered
    }

    pub async fn get(&self, position_id: Uuid) -> Option<Position> {
        self.positions.read().await.get(&position_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Position> {
        self.positions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn total_value_usd(&self) -> Decimal {
        self.positions
            .read()
            .await
            .values()
            .map(|p| p.current_value_usd())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(token: Address) -> Position {
        Position::open(
            1,
            token,
            "T".into(),
            dec!(100),
            dec!(1.00),
            Some(dec!(0.85)),
            Some(dec!(1.30)),
        )
    }

    #[tokio::test]
    async fn test_open_close_roundtrip() {
        let shard = ChainShard::new(1);
        let token = Address::random();
        let id = shard.open(position(token)).await;
        assert_eq!(shard.count().await, 1);

        let (closed, realized) = shard.close(id, dec!(1.10)).await.unwrap();
        assert_eq!(closed.token_address, token);
        assert_eq!(realized, dec!(10));
        assert_eq!(shard.count().await, 0);
    }

    #[tokio::test]
    async fn test_close_unknown_position() {
        let shard = ChainShard::new(1);
        let err = shard.close(Uuid::new_v4(), dec!(1)).await.unwrap_err();
        assert!(matches!(err, Error::PositionNotFound(_)));
    }

    #[tokio::test]
    async fn test_price_fanout_triggers_stops() {
        let shard = ChainShard::new(1);
        let token = Address::random();
        shard.open(position(token)).await;
        shard.open(position(token)).await;
        shard.open(position(Address::random())).await;

        let triggered = shard.update_price(token, dec!(0.80)).await;
        assert_eq!(triggered.len(), 2);
        assert!(triggered.iter().all(|(_, c)| *c == ExitCheck::StopLoss));

        // The unrelated token was untouched.
        let snapshot = shard.snapshot().await;
        let other = snapshot
            .iter()
            .find(|p| p.token_address != token)
            .unwrap();
        assert_eq!(other.current_price_usd, dec!(1.00));
    }

    #[tokio::test]
    async fn test_total_value_tracks_prices() {
        let shard = ChainShard::new(1);
        let token = Address::random();
        shard.open(position(token)).await;
        assert_eq!(shard.total_value_usd().await, dec!(100));

        shard.update_price(token, dec!(1.20)).await;
        assert_eq!(shard.total_value_usd().await, dec!(120));
    }
}
