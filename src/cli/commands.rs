//! CLI command implementations

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{Config, TradingMode};
use crate::engine::Engine;

/// Start the trading engine and run until interrupted.
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    let mut config = config.clone();
    if dry_run && config.engine.trading_mode == TradingMode::Live {
        warn!("--dry-run overrides LIVE mode; running PAPER");
        config.engine.trading_mode = TradingMode::Paper;
    }

    info!("Starting engine");
    println!("{}", config.masked_display());

    let engine = Engine::new(config)?;
    let cancel = engine.cancellation_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; shutting down");
            cancel.cancel();
        }
    });

    engine.run().await?;
    info!("Engine stopped");
    Ok(())
}

/// Print the effective configuration with secrets masked.
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Print current portfolio state without starting discovery or trading.
pub async fn status(config: &Config) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let snapshot = engine.portfolio().snapshot().await;

    println!("Portfolio:");
    println!("  total value:       ${}", snapshot.total_value_usd);
    println!("  available capital: ${}", snapshot.available_capital_usd);
    println!("  open positions:    {}", snapshot.position_count);
    println!("  daily P&L:         ${}", snapshot.daily_pnl_usd);
    println!("  cumulative P&L:    ${}", snapshot.cumulative_pnl_usd);
    println!("  win rate:          {:.1}%", snapshot.win_rate_pct);
    if snapshot.active_breakers.is_empty() {
        println!("  breakers:          none active");
    } else {
        for breaker in &snapshot.active_breakers {
            println!(
                "  breaker:           {:?} ({})",
                breaker.breaker_type, breaker.description
            );
        }
    }
    Ok(())
}

/// Probe every configured provider on every target chain.
pub async fn health(config: &Config) -> Result<()> {
    use crate::chain::ChainRegistry;
    use crate::provider::ProviderManager;
    use std::sync::Arc;

    let registry = ChainRegistry::for_chains(
        &config.engine.target_chains,
        config.engine.testnet_mode,
    )?;

    for chain in registry.chains() {
        println!("Chain {} ({}):", chain.chain_id, chain.name);
        let providers = ProviderManager::new(Arc::new(chain.clone()), config.provider.clone())?;
        providers.run_health_checks().await;
        for snapshot in providers.health_summary().await {
            println!(
                "  {:<12} {:?} (avg {:.0}ms, {:.1}% ok)",
                snapshot.name,
                snapshot.status,
                snapshot.average_latency_ms,
                snapshot.success_rate,
            );
        }
    }
    Ok(())
}
