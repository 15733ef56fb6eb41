//! DEX Trading Engine - automated pool discovery and trading
//!
//! # WARNING
//! - This engine trades with real money in LIVE mode. Only use funds you
//!   can afford to lose.
//! - Most freshly created pools are scams (honeypots, rug pulls).
//! - Start in PAPER mode and graduate through SHADOW before going LIVE.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use dexlane::cli::commands;
use dexlane::config::Config;

/// DEX trading engine - pool discovery, risk analysis, execution
#[derive(Parser)]
#[command(name = "dexlane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading engine
    Start {
        /// Force paper mode regardless of configuration
        #[arg(long)]
        dry_run: bool,
    },

    /// Show portfolio state and P&L
    Status,

    /// Show current configuration (secrets masked)
    Config,

    /// Check RPC provider health across target chains
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dexlane=info".parse().unwrap()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start { dry_run } => commands::start(&config, dry_run).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
