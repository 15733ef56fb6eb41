//! Global portfolio manager
//!
//! Aggregates the per-chain shards, gates new positions against capital,
//! concentration and circuit-breaker state, and keeps realized/daily P&L
//! and performance metrics. Snapshots always satisfy
//! `Σ position_value + available_capital = total_value`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use ethers::types::Address;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PortfolioConfig;
use crate::error::{Error, Result};

use super::breaker::{BreakerInputs, BreakerType, CircuitBreakerEvent, CircuitBreakerManager};
use super::position::{ExitCheck, Position};
use super::shard::ChainShard;

/// Read-only portfolio snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub total_value_usd: Decimal,
    pub available_capital_usd: Decimal,
    pub positions_value_usd: Decimal,
    pub position_count: usize,
    pub daily_pnl_usd: Decimal,
    pub cumulative_pnl_usd: Decimal,
    pub consecutive_losses: u32,
    pub win_rate_pct: f64,
    pub max_drawdown_pct: f64,
    pub active_breakers: Vec<CircuitBreakerEvent>,
}

#[derive(Debug, Default)]
struct LedgerState {
    available_capital: Decimal,
    daily_pnl: Decimal,
    daily_date: Option<NaiveDate>,
    cumulative_pnl: Decimal,
    consecutive_losses: u32,
    wins: u32,
    losses: u32,
    /// Running equity peak for drawdown tracking
    equity_peak: Decimal,
    max_drawdown_pct: f64,
}

pub struct PortfolioManager {
    config: PortfolioConfig,
    shards: HashMap<u64, Arc<ChainShard>>,
    ledger: Mutex<LedgerState>,
    breakers: Mutex<CircuitBreakerManager>,
}

impl PortfolioManager {
    pub fn new(config: PortfolioConfig, chain_ids: &[u64]) -> Arc<Self> {
        let shards = chain_ids
            .iter()
            .map(|id| (*id, ChainShard::new(*id)))
            .collect();

        let daily_limit =
            config.max_portfolio_size_usd * config.daily_loss_limit_percent / Decimal::from(100);
        let portfolio_limit = config.max_portfolio_size_usd * config.circuit_breaker_loss_percent
            / Decimal::from(100);

        let breakers = CircuitBreakerManager::new(
            daily_limit,
            portfolio_limit,
            config.consecutive_loss_limit,
            0.8,
        );

        Arc::new(Self {
            ledger: Mutex::new(LedgerState {
                available_capital: config.max_portfolio_size_usd,
                equity_peak: config.max_portfolio_size_usd,
                ..Default::default()
            }),
            breakers: Mutex::new(breakers),
            config,
            shards,
        })
    }

    pub fn shard(&self, chain_id: u64) -> Result<&Arc<ChainShard>> {
        self.shards
            .get(&chain_id)
            .ok_or(Error::UnknownChain(chain_id))
    }

    /// Pre-trade gate, checked in order:
    /// 1. no active breaker, 2. per-position cap, 3. available capital,
    /// 4. single-position concentration.
    pub async fn can_open_position(&self, size_usd: Decimal, chain_id: u64) -> Result<()> {
        self.shard(chain_id)?;

        {
            let mut breakers = self.breakers.lock().await;
            let (ok, reasons) = breakers.can_trade();
            if !ok {
                return Err(Error::TradingHalted(reasons.join("; ")));
            }
        }

        if size_usd > self.config.max_position_size_usd {
            return Err(Error::MaxPositionExceeded {
                requested: size_usd.to_string(),
                max: self.config.max_position_size_usd.to_string(),
            });
        }

        let snapshot = self.snapshot().await;
        if size_usd > snapshot.available_capital_usd {
            return Err(Error::InsufficientFunds {
                available: snapshot.available_capital_usd.to_string(),
                required: size_usd.to_string(),
            });
        }

        if snapshot.total_value_usd > Decimal::ZERO {
            let share = (size_usd / snapshot.total_value_usd)
                .to_f64()
                .unwrap_or(1.0);
            if share > self.config.concentration_limit {
                return Err(Error::ConcentrationExceeded { pct: share * 100.0 });
            }
        }

        Ok(())
    }

    /// Open a position after the gate has passed; capital is reserved.
    pub async fn open_position(&self, position: Position) -> Result<Uuid> {
        let chain_id = position.chain_id;
        let value = position.initial_value_usd;
        self.can_open_position(value, chain_id).await?;

        {
            let mut ledger = self.ledger.lock().await;
            ledger.available_capital -= value;
        }

        Ok(self.shard(chain_id)?.open(position).await)
    }

    /// Close a position at an exit price, realize P&L and feed the
    /// breaker state. Returns the realized P&L.
    pub async fn close_position(
        &self,
        chain_id: u64,
        position_id: Uuid,
        exit_price_usd: Decimal,
    ) -> Result<Decimal> {
        let (position, realized) = self
            .shard(chain_id)?
            .close(position_id, exit_price_usd)
            .await?;

        self.record_trade_result(position.initial_value_usd + realized, realized)
            .await;
        Ok(realized)
    }

    async fn record_trade_result(&self, returned_capital: Decimal, realized: Decimal) {
        let fired = {
            let mut ledger = self.ledger.lock().await;
            ledger.available_capital += returned_capital;

            let today = Utc::now().date_naive();
            if ledger.daily_date != Some(today) {
                ledger.daily_date = Some(today);
                ledger.daily_pnl = Decimal::ZERO;
            }
            ledger.daily_pnl += realized;
            ledger.cumulative_pnl += realized;

            if realized < Decimal::ZERO {
                ledger.consecutive_losses += 1;
                ledger.losses += 1;
            } else {
                ledger.consecutive_losses = 0;
                ledger.wins += 1;
            }

            let equity = self.config.max_portfolio_size_usd + ledger.cumulative_pnl;
            if equity > ledger.equity_peak {
                ledger.equity_peak = equity;
            } else if ledger.equity_peak > Decimal::ZERO {
                let drawdown = ((ledger.equity_peak - equity) / ledger.equity_peak)
                    .to_f64()
                    .unwrap_or(0.0)
                    * 100.0;
                ledger.max_drawdown_pct = ledger.max_drawdown_pct.max(drawdown);
            }

            let inputs = BreakerInputs {
                daily_pnl: ledger.daily_pnl,
                cumulative_pnl: ledger.cumulative_pnl,
                consecutive_losses: ledger.consecutive_losses,
                portfolio_volatility: 0.0,
            };
            drop(ledger);

            let mut breakers = self.breakers.lock().await;
            breakers.check(&inputs)
        };

        for event in fired {
            warn!(breaker = ?event.breaker_type, "Breaker activated by trade result");
        }
    }

    /// Fan a price update out to the chain shard; returns positions whose
    /// exit levels fired so the caller can route sells to the executor.
    pub async fn update_price(
        &self,
        chain_id: u64,
        token: Address,
        price_usd: Decimal,
    ) -> Result<Vec<(Position, ExitCheck)>> {
        Ok(self.shard(chain_id)?.update_price(token, price_usd).await)
    }

    /// Close everything at market and forbid opens until manual reset.
    pub async fn emergency_stop(&self, reason: &str) -> Vec<Position> {
        warn!(reason, "EMERGENCY STOP: closing all positions");
        {
            let mut breakers = self.breakers.lock().await;
            breakers.trigger_external(reason);
        }

        let mut to_close = Vec::new();
        for shard in self.shards.values() {
            to_close.extend(shard.snapshot().await);
        }
        info!(count = to_close.len(), "Positions queued for emergency close");
        to_close
    }

    pub async fn manual_reset(&self, breaker_type: Option<BreakerType>) -> usize {
        self.breakers.lock().await.manual_reset(breaker_type)
    }

    /// Consistent snapshot across all shards.
    pub async fn snapshot(&self) -> PortfolioSnapshot {
        let mut positions_value = Decimal::ZERO;
        let mut position_count = 0usize;
        for shard in self.shards.values() {
            positions_value += shard.total_value_usd().await;
            position_count += shard.count().await;
        }

        let ledger = self.ledger.lock().await;
        let total = positions_value + ledger.available_capital;
        let trades = ledger.wins + ledger.losses;
        let win_rate = if trades == 0 {
            0.0
        } else {
            ledger.wins as f64 / trades as f64 * 100.0
        };

        let active_breakers = {
            let breakers = self.breakers.lock().await;
            breakers.active_breakers().to_vec()
        };

        PortfolioSnapshot {
            total_value_usd: total,
            available_capital_usd: ledger.available_capital,
            positions_value_usd: positions_value,
            position_count,
            daily_pnl_usd: ledger.daily_pnl,
            cumulative_pnl_usd: ledger.cumulative_pnl,
            consecutive_losses: ledger.consecutive_losses,
            win_rate_pct: win_rate,
            max_drawdown_pct: ledger.max_drawdown_pct,
            active_breakers,
        }
    }

    /// Pipeline view: heat and capacity inputs for sizing.
    pub async fn heat_pct(&self) -> f64 {
        let snapshot = self.snapshot().await;
        if snapshot.total_value_usd.is_zero() {
            return 0.0;
        }
        (snapshot.positions_value_usd / snapshot.total_value_usd)
            .to_f64()
            .unwrap_or(0.0)
            * 100.0
    }

    pub async fn open_position_count(&self) -> usize {
        let mut count = 0;
        for shard in self.shards.values() {
            count += shard.count().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> Arc<PortfolioManager> {
        // $10k portfolio, $1k positions, 5% daily loss, 10% breaker
        PortfolioManager::new(PortfolioConfig::default(), &[1, 8453])
    }

    fn position(chain: u64, value: Decimal) -> Position {
        Position::open(
            chain,
            Address::random(),
            "T".into(),
            value,
            dec!(1.00),
            Some(dec!(0.80)),
            None,
        )
    }

    #[tokio::test]
    async fn test_accounting_identity_holds() {
        let m = manager();
        let before = m.snapshot().await;
        assert_eq!(
            before.total_value_usd,
            before.available_capital_usd + before.positions_value_usd
        );
        assert_eq!(before.available_capital_usd, dec!(10000));

        let id = m.open_position(position(1, dec!(500))).await.unwrap();
        let mid = m.snapshot().await;
        assert_eq!(mid.positions_value_usd, dec!(500));
        assert_eq!(mid.available_capital_usd, dec!(9500));
        assert_eq!(
            mid.total_value_usd,
            mid.available_capital_usd + mid.positions_value_usd
        );

        // Close at +10%; concentration returns to prior state plus P&L.
        let realized = m.close_position(1, id, dec!(1.10)).await.unwrap();
        assert_eq!(realized, dec!(50));
        let after = m.snapshot().await;
        assert_eq!(after.position_count, 0);
        assert_eq!(after.available_capital_usd, dec!(10050));
        assert_eq!(after.cumulative_pnl_usd, dec!(50));
    }

    #[tokio::test]
    async fn test_gate_rejects_oversized_position() {
        let m = manager();
        let err = m.can_open_position(dec!(1500), 1).await.unwrap_err();
        assert!(matches!(err, Error::MaxPositionExceeded { .. }));
    }

    #[tokio::test]
    async fn test_gate_rejects_concentration() {
        let mut config = PortfolioConfig::default();
        config.max_position_size_usd = dec!(5000);
        let m = PortfolioManager::new(config, &[1]);

        // 2000/10000 = 20% > 15% cap
        let err = m.can_open_position(dec!(2000), 1).await.unwrap_err();
        assert!(matches!(err, Error::ConcentrationExceeded { .. }));

        // 1000/10000 = 10% passes
        m.can_open_position(dec!(1000), 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_daily_loss_breaker_gates_opens() {
        let m = manager();

        // Lose exactly the daily limit ($500 on $10k at 5%).
        let id = m.open_position(position(1, dec!(1000))).await.unwrap();
        m.close_position(1, id, dec!(0.50)).await.unwrap();

        let snapshot = m.snapshot().await;
        assert_eq!(snapshot.daily_pnl_usd, dec!(-500));
        assert!(snapshot
            .active_breakers
            .iter()
            .any(|b| b.breaker_type == BreakerType::DailyLoss));

        let err = m.can_open_position(dec!(100), 1).await.unwrap_err();
        assert!(matches!(err, Error::TradingHalted(_)));
    }

    #[tokio::test]
    async fn test_loss_just_inside_limit_does_not_trip() {
        let m = manager();
        let id = m.open_position(position(1, dec!(999))).await.unwrap();
        // -49.95% of $999 ≈ -$499.00, inside the $500 limit
        m.close_position(1, id, dec!(0.5005)).await.unwrap();

        let snapshot = m.snapshot().await;
        assert!(snapshot.daily_pnl_usd > dec!(-500));
        assert!(snapshot.active_breakers.is_empty());
        m.can_open_position(dec!(100), 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_losses_tracked() {
        let m = manager();
        for _ in 0..3 {
            let id = m.open_position(position(1, dec!(100))).await.unwrap();
            m.close_position(1, id, dec!(0.99)).await.unwrap();
        }
        assert_eq!(m.snapshot().await.consecutive_losses, 3);

        let id = m.open_position(position(1, dec!(100))).await.unwrap();
        m.close_position(1, id, dec!(1.01)).await.unwrap();
        assert_eq!(m.snapshot().await.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_and_lists() {
        let m = manager();
        m.open_position(position(1, dec!(100))).await.unwrap();
        m.open_position(position(8453, dec!(200))).await.unwrap();

        let to_close = m.emergency_stop("test halt").await;
        assert_eq!(to_close.len(), 2);

        let err = m.can_open_position(dec!(50), 1).await.unwrap_err();
        assert!(matches!(err, Error::TradingHalted(_)));

        assert_eq!(m.manual_reset(Some(BreakerType::External)).await, 1);
        m.can_open_position(dec!(50), 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_price_update_triggers_stop() {
        let m = manager();
        let p = position(1, dec!(100));
        let token = p.token_address;
        m.open_position(p).await.unwrap();

        let triggered = m.update_price(1, token, dec!(0.75)).await.unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].1, ExitCheck::StopLoss);
    }

    #[tokio::test]
    async fn test_available_capital_never_negative() {
        let mut config = PortfolioConfig::default();
        config.max_position_size_usd = dec!(10000);
        config.concentration_limit = 1.0;
        let m = PortfolioManager::new(config, &[1]);

        // Drain most of the capital, then ask for more than remains.
        m.open_position(position(1, dec!(9000))).await.unwrap();
        let err = m.can_open_position(dec!(2000), 1).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert!(m.snapshot().await.available_capital_usd >= Decimal::ZERO);
    }
}
