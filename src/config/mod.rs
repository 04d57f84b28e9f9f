//! Configuration management for the market data engine.

use crate::utils::error::Result;
use crate::utils::types::Timeframe;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, time::Duration};

/// Main configuration structure for the market data engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General application settings
    pub app: AppConfig,
    /// Streaming source settings
    pub stream: StreamConfig,
    /// REST snapshot source settings
    pub rest: RestConfig,
    /// CLI snapshot source settings
    pub cli: CliConfig,
    /// Candle history limits
    pub candles: CandleConfig,
    /// Signal rule thresholds
    pub signals: SignalConfig,
}

/// Application-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level (debug, info, warn, error)
    pub log_level: String,
    /// Periodic full signal sweep interval, seconds
    pub sweep_interval_secs: u64,
    /// Optional cap on the number of catalog instruments tracked
    pub max_instruments: Option<usize>,
    /// Instrument catalog cache TTL, seconds
    pub catalog_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sweep_interval_secs: 60,
            max_instruments: None,
            catalog_ttl_secs: 3600,
        }
    }
}

/// Streaming source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    /// Combined-stream WebSocket base URL
    pub ws_url: String,
    /// Fixed delay between a disconnect and the next connect attempt, seconds
    pub reconnect_delay_secs: u64,
    /// Per-connection stream cap; larger instrument sets are partitioned
    pub max_streams_per_connection: usize,
    /// Kline intervals subscribed on the stream (and seeded over REST)
    pub kline_intervals: Vec<Timeframe>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_url: "wss://fstream.binance.com/stream".to_string(),
            reconnect_delay_secs: 5,
            max_streams_per_connection: 200,
            kline_intervals: vec![Timeframe::M1, Timeframe::H1],
        }
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// REST snapshot source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub base_url: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Cap on per-symbol open-interest/funding enrichment per poll cycle,
    /// applied when this source owns the derivative fields
    pub derivs_limit: usize,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            poll_interval_secs: 60,
            request_timeout_secs: 10,
            derivs_limit: 30,
        }
    }
}

impl RestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// CLI snapshot source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub enabled: bool,
    /// Program plus arguments, e.g. ["terminal-cli", "market", "perpetuals", "--json"]
    pub command: Vec<String>,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    /// Cap on per-symbol REST back-fills for symbols missing from the CLI
    /// output; overflow is deferred to the next cycle
    pub fallback_limit: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: vec![
                "terminal-cli".to_string(),
                "market".to_string(),
                "perpetuals".to_string(),
                "--json".to_string(),
            ],
            poll_interval_secs: 15,
            timeout_secs: 30,
            fallback_limit: 25,
        }
    }
}

impl CliConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Candle history limits per timeframe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandleConfig {
    pub limits: HashMap<Timeframe, usize>,
}

impl Default for CandleConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(Timeframe::M1, 1440); // 1 minute candles for 24h
        limits.insert(Timeframe::H1, 168); // 1 hour candles for 7 days
        limits.insert(Timeframe::H4, 42); // 4 hour candles for 7 days
        limits.insert(Timeframe::D1, 30); // Daily candles for 30 days
        Self { limits }
    }
}

/// Signal rule thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Volume spike: current / trailing-average ratio
    pub volume_spike_threshold: f64,
    /// Trailing average window, in 1h candles
    pub volume_lookback: usize,
    /// Short-horizon momentum, percent
    pub momentum_threshold_pct: f64,
    /// 24h volatility, percent
    pub volatility_threshold_pct: f64,
    /// Near-extreme distance as a fraction of the extreme
    pub near_extreme_threshold: f64,
    /// Absolute funding rate threshold
    pub funding_threshold: f64,
    /// Open interest ratio jump threshold
    pub oi_jump_threshold: f64,
    /// Consecutive same-direction closes for a stair-step
    pub stair_step_run: usize,
    /// Rolling range window, in candles
    pub range_break_lookback: usize,
    /// Breakout margin beyond the range, as a fraction
    pub range_break_margin: f64,
    /// Tick-to-tick price change, percent
    pub tick_spike_threshold_pct: f64,
    /// RSI period for the multi-timeframe RSI detail
    pub rsi_period: usize,
    /// Evaluation batches retained for history queries
    pub history_cap: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            volume_spike_threshold: 2.0,
            volume_lookback: 24,
            momentum_threshold_pct: 3.0,
            volatility_threshold_pct: 10.0,
            near_extreme_threshold: 0.01,
            funding_threshold: 0.05,
            oi_jump_threshold: 1.5,
            stair_step_run: 3,
            range_break_lookback: 24,
            range_break_margin: 0.02,
            tick_spike_threshold_pct: 0.5,
            rsi_period: 14,
            history_cap: 1000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stream.reconnect_delay_secs, 5);
        assert_eq!(config.stream.max_streams_per_connection, 200);
        assert_eq!(config.signals.volume_spike_threshold, 2.0);
        assert_eq!(config.candles.limits[&Timeframe::H1], 168);
        assert_eq!(config.cli.fallback_limit, 25);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[app]
log_level = "debug"

[stream]
reconnect_delay_secs = 2

[candles.limits]
"1h" = 48
"#
        )
        .expect("write config");

        let config = Config::load(file.path()).expect("load config");
        assert_eq!(config.app.log_level, "debug");
        assert_eq!(config.stream.reconnect_delay_secs, 2);
        // overridden table replaces the default map
        assert_eq!(config.candles.limits[&Timeframe::H1], 48);
        // untouched sections keep their defaults
        assert_eq!(config.rest.poll_interval_secs, 60);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/config.toml").is_err());
    }
}
