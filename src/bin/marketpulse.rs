//! Command-line entry point for the marketpulse scanner.

use clap::Parser;
use marketpulse::utils::init_logging;
use marketpulse::{Config, MarketEngine};
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-source market data scanner", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Track only these symbols instead of the full catalog
    #[arg(short, long)]
    symbols: Vec<String>,

    /// Cap the number of catalog instruments tracked
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    if args.debug {
        config.app.log_level = "debug".to_string();
    }
    if let Some(limit) = args.limit {
        config.app.max_instruments = Some(limit);
    }
    init_logging(&config.app.log_level);

    let engine = Arc::new(MarketEngine::new(config));
    if args.symbols.is_empty() {
        engine.start().await?;
    } else {
        let symbols = args.symbols.iter().map(|s| s.to_uppercase()).collect();
        engine.start_with_symbols(symbols).await?;
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    engine.stop();
    engine.join().await;
    Ok(())
}
