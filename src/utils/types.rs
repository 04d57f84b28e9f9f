//! Common types used throughout the market data engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Candle timeframe buckets supported by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M1, Timeframe::H1, Timeframe::H4, Timeframe::D1];

    /// Exchange-facing interval string, e.g. "1m"
    pub fn as_str(&self) -> &'static str {
        match self {
            | Timeframe::M1 => "1m",
            | Timeframe::H1 => "1h",
            | Timeframe::H4 => "4h",
            | Timeframe::D1 => "1d",
        }
    }

    /// Parse an exchange interval string (e.g. "1h") into a timeframe
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            | "1m" => Some(Timeframe::M1),
            | "1h" => Some(Timeframe::H1),
            | "4h" => Some(Timeframe::H4),
            | "1d" => Some(Timeframe::D1),
            | _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single trade event from the streaming source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    /// Exchange-reported event time (epoch millis)
    pub exchange_ts: i64,
}

/// An OHLCV aggregate over a fixed timeframe bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time (epoch millis); identifies the candle within its series
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub close_time: i64,
}

impl Candle {
    /// Whether the candle closed above its open
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Whether the candle closed below its open
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// 24h ticker statistics, owned by the REST snapshot source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketStats {
    pub last_price: f64,
    pub price_change_pct_24h: f64,
    pub open_price_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub quote_volume_24h: f64,
    pub trade_count_24h: u64,
}

/// Derivative statistics, owned by the CLI snapshot source (with REST fallback).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivativeStats {
    pub open_interest: Option<f64>,
    pub funding_rate: Option<f64>,
    pub tick_count: Option<u64>,
}

/// Snapshot fields for one instrument. Each section is overwritten wholesale
/// by its owning source; a `None` section leaves the stored value untouched,
/// so sources never clobber each other's fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub stats: Option<MarketStats>,
    pub derivs: Option<DerivativeStats>,
}

impl Snapshot {
    pub fn from_stats(stats: MarketStats) -> Self {
        Self { stats: Some(stats), derivs: None }
    }

    pub fn from_derivs(derivs: DerivativeStats) -> Self {
        Self { stats: None, derivs: Some(derivs) }
    }
}

/// Category of an update published on the fan-out bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    Tick,
    Candle,
    Snapshot,
}

/// One update notification, produced by a source after a successful store merge.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub kind: UpdateKind,
    pub symbol: String,
    /// Set for candle updates only
    pub timeframe: Option<Timeframe>,
}

/// Data freshness category tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    Tick,
    Candle(Timeframe),
    Snapshot,
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            | DataCategory::Tick => write!(f, "tick"),
            | DataCategory::Candle(tf) => write!(f, "candle:{}", tf),
            | DataCategory::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// A single triggered signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalHit {
    /// Stable tag, e.g. "volume_spike" or "near_high"
    pub tag: String,
    /// Human-readable detail, e.g. "3.2x average 1h volume"
    pub detail: String,
}

impl SignalHit {
    pub fn new(tag: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { tag: tag.into(), detail: detail.into() }
    }
}

/// One evaluation pass over one instrument.
#[derive(Debug, Clone)]
pub struct SignalBatch {
    pub symbol: String,
    pub hits: Vec<SignalHit>,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one instrument, cloned out of the store under its
/// entry lock so readers never observe a partially-written record.
#[derive(Debug, Clone, Default)]
pub struct InstrumentView {
    pub symbol: String,
    pub stats: Option<MarketStats>,
    pub derivs: Option<DerivativeStats>,
    /// Open interest from the previous snapshot merge, kept for jump detection
    pub prev_open_interest: Option<f64>,
    pub last_tick: Option<Tick>,
    /// Price of the tick before the current one, kept for tick-spike detection
    pub prev_tick_price: Option<f64>,
    pub candles: HashMap<Timeframe, Vec<Candle>>,
}

impl InstrumentView {
    /// Best-known current price: last streamed tick, else polled last price
    pub fn last_price(&self) -> Option<f64> {
        self.last_tick
            .as_ref()
            .map(|t| t.price)
            .or_else(|| self.stats.as_ref().map(|s| s.last_price))
    }

    /// Candle series for a timeframe, empty slice when none stored
    pub fn series(&self, tf: Timeframe) -> &[Candle] {
        self.candles.get(&tf).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
