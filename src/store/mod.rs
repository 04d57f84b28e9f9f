//! Shared instrument store - the single point of truth merging data from all
//! source adapters.
//!
//! State is sharded per instrument in a `DashMap`, so concurrent writers of
//! different instruments never contend. Writers of the same instrument are
//! serialized by the entry lock, and readers get a fully-written point-in-time
//! clone (`InstrumentView`) - never a torn record. Writes from different
//! sources touch disjoint fields (tick / candle series / snapshot sections),
//! so no cross-source coordination is needed.

use crate::utils::types::{
    Candle, DataCategory, DerivativeStats, InstrumentView, MarketStats, Snapshot, Tick, Timeframe,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Series cap applied when a timeframe has no configured limit
const DEFAULT_CANDLE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default)]
struct InstrumentState {
    stats: Option<MarketStats>,
    derivs: Option<DerivativeStats>,
    prev_open_interest: Option<f64>,
    last_tick: Option<Tick>,
    prev_tick_price: Option<f64>,
    candles: HashMap<Timeframe, VecDeque<Candle>>,
}

/// The merge point for all source adapters.
pub struct InstrumentStore {
    instruments: DashMap<String, InstrumentState>,
    limits: HashMap<Timeframe, usize>,
    ages: DashMap<DataCategory, DateTime<Utc>>,
}

impl InstrumentStore {
    pub fn new(limits: HashMap<Timeframe, usize>) -> Self {
        Self {
            instruments: DashMap::new(),
            limits,
            ages: DashMap::new(),
        }
    }

    fn limit(&self, tf: Timeframe) -> usize {
        self.limits.get(&tf).copied().unwrap_or(DEFAULT_CANDLE_LIMIT)
    }

    fn touch(&self, category: DataCategory) {
        self.ages.insert(category, Utc::now());
    }

    /// Replace the last tick for an instrument, retaining the previous price.
    pub fn merge_tick(&self, tick: Tick) {
        let mut state = self.instruments.entry(tick.symbol.clone()).or_default();
        state.prev_tick_price = state.last_tick.as_ref().map(|t| t.price);
        state.last_tick = Some(tick);
        drop(state);
        self.touch(DataCategory::Tick);
    }

    /// Merge one candle into an instrument's series.
    ///
    /// A candle whose `open_time` equals the series tail replaces it in place;
    /// a later `open_time` appends and the series is truncated from the front
    /// to the timeframe cap. Candles older than the tail are dropped, keeping
    /// the series sorted and free of duplicates.
    pub fn merge_candle(&self, symbol: &str, tf: Timeframe, candle: Candle) {
        let mut state = self.instruments.entry(symbol.to_string()).or_default();
        let cap = self.limit(tf);
        let series = state.candles.entry(tf).or_default();

        let tail_time = series.back().map(|c| c.open_time);
        match tail_time {
            | Some(t) if t == candle.open_time => {
                if let Some(last) = series.back_mut() {
                    *last = candle;
                }
            }
            | Some(t) if t > candle.open_time => {
                log::debug!(
                    "dropping stale {} candle for {} ({} behind series tail)",
                    tf,
                    symbol,
                    candle.open_time
                );
                return;
            }
            | _ => {
                series.push_back(candle);
                while series.len() > cap {
                    series.pop_front();
                }
            }
        }
        drop(state);
        self.touch(DataCategory::Candle(tf));
    }

    /// Replace an instrument's whole series for a timeframe, as polled sources
    /// do. The input is normalized (sorted by `open_time`, later entries win on
    /// duplicates, truncated to the cap) so the series invariants hold
    /// regardless of what the source returned.
    pub fn replace_candles(&self, symbol: &str, tf: Timeframe, mut series: Vec<Candle>) {
        series.sort_by_key(|c| c.open_time);
        let mut deduped: Vec<Candle> = Vec::with_capacity(series.len());
        for candle in series {
            match deduped.last_mut() {
                | Some(last) if last.open_time == candle.open_time => *last = candle,
                | _ => deduped.push(candle),
            }
        }
        let cap = self.limit(tf);
        if deduped.len() > cap {
            deduped.drain(..deduped.len() - cap);
        }

        let mut state = self.instruments.entry(symbol.to_string()).or_default();
        state.candles.insert(tf, deduped.into());
        drop(state);
        self.touch(DataCategory::Candle(tf));
    }

    /// Overwrite snapshot fields for an instrument. Each section present in
    /// the incoming snapshot is replaced wholesale; absent sections are left
    /// untouched so the REST and CLI sources never clobber each other.
    pub fn merge_snapshot(&self, symbol: &str, snapshot: Snapshot) {
        let mut state = self.instruments.entry(symbol.to_string()).or_default();
        if let Some(stats) = snapshot.stats {
            state.stats = Some(stats);
        }
        if let Some(derivs) = snapshot.derivs {
            if let Some(oi) = state.derivs.as_ref().and_then(|d| d.open_interest) {
                state.prev_open_interest = Some(oi);
            }
            state.derivs = Some(derivs);
        }
        drop(state);
        self.touch(DataCategory::Snapshot);
    }

    /// Point-in-time view of one instrument
    pub fn get(&self, symbol: &str) -> Option<InstrumentView> {
        self.instruments.get(symbol).map(|state| InstrumentView {
            symbol: symbol.to_string(),
            stats: state.stats.clone(),
            derivs: state.derivs.clone(),
            prev_open_interest: state.prev_open_interest,
            last_tick: state.last_tick.clone(),
            prev_tick_price: state.prev_tick_price,
            candles: state
                .candles
                .iter()
                .map(|(tf, series)| (*tf, series.iter().cloned().collect()))
                .collect(),
        })
    }

    /// All instruments currently known to the store
    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Time since the last successful merge for a data category
    pub fn data_age(&self, category: DataCategory) -> Option<Duration> {
        self.ages
            .get(&category)
            .and_then(|ts| (Utc::now() - *ts).to_std().ok())
    }
}
