//! Position state and P&L math

use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An open position in one token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Uuid,
    pub token_address: Address,
    pub chain_id: u64,
    pub symbol: String,
    /// Token quantity in display units
    pub quantity: Decimal,
    pub entry_price_usd: Decimal,
    pub current_price_usd: Decimal,
    pub initial_value_usd: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

/// Outcome of re-evaluating exits after a price update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCheck {
    None,
    StopLoss,
    TakeProfit,
}

impl Position {
    pub fn open(
        chain_id: u64,
        token_address: Address,
        symbol: String,
        quantity: Decimal,
        entry_price_usd: Decimal,
        stop_loss_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4(),
            token_address,
            chain_id,
            symbol,
            quantity,
            entry_price_usd,
            current_price_usd: entry_price_usd,
            initial_value_usd: quantity * entry_price_usd,
            stop_loss_price,
            take_profit_price,
            opened_at: Utc::now(),
        }
    }

    pub fn current_value_usd(&self) -> Decimal {
        self.quantity * self.current_price_usd
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.current_value_usd() - self.initial_value_usd
    }

    pub fn unrealized_pnl_pct(&self) -> Decimal {
        if self.initial_value_usd.is_zero() {
            return Decimal::ZERO;
        }
        self.unrealized_pnl() / self.initial_value_usd * Decimal::from(100)
    }

    /// Apply a price update and report any exit level it crossed.
    /// Stop-loss wins when both could fire on the same update.
    pub fn update_price(&mut self, price_usd: Decimal) -> ExitCheck {
        self.current_price_usd = price_usd;

        if let Some(stop) = self.stop_loss_price {
            if price_usd <= stop {
                return ExitCheck::StopLoss;
            }
        }
        if let Some(target) = self.take_profit_price {
            if price_usd >= target {
                return ExitCheck::TakeProfit;
            }
        }
        ExitCheck::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::open(
            1,
            Address::random(),
            "NEW".into(),
            dec!(1000),
            dec!(0.50),
            Some(dec!(0.40)),
            Some(dec!(0.75)),
        )
    }

    #[test]
    fn test_initial_value() {
        let p = position();
        assert_eq!(p.initial_value_usd, dec!(500));
        assert_eq!(p.current_value_usd(), dec!(500));
        assert_eq!(p.unrealized_pnl(), Decimal::ZERO);
    }

    #[test]
    fn test_pnl_after_move() {
        let mut p = position();
        assert_eq!(p.update_price(dec!(0.60)), ExitCheck::None);
        assert_eq!(p.unrealized_pnl(), dec!(100));
        assert_eq!(p.unrealized_pnl_pct(), dec!(20));
    }

    #[test]
    fn test_stop_loss_fires() {
        let mut p = position();
        assert_eq!(p.update_price(dec!(0.40)), ExitCheck::StopLoss);
        assert_eq!(p.update_price(dec!(0.39)), ExitCheck::StopLoss);
    }

    #[test]
    fn test_take_profit_fires() {
        let mut p = position();
        assert_eq!(p.update_price(dec!(0.75)), ExitCheck::TakeProfit);
    }

    #[test]
    fn test_stop_loss_wins_over_take_profit() {
        // Degenerate config where stop sits above target
        let mut p = Position::open(
            1,
            Address::random(),
            "X".into(),
            dec!(10),
            dec!(1),
            Some(dec!(2)),
            Some(dec!(1.5)),
        );
        assert_eq!(p.update_price(dec!(1.8)), ExitCheck::StopLoss);
    }
}
