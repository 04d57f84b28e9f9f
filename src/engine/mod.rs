//! Market data engine - wires the catalog, sources, store, signal processor
//! and fan-out bus together and supervises the long-lived tasks.
//!
//! One task per stream connection group, one per polling adapter, one
//! serialized signal-evaluation queue fed by the fan-out bus, and one
//! periodic sweep covering instruments that receive no updates. Nothing
//! below `start` terminates the process: per-source and per-rule failures
//! are absorbed and logged. The one terminal failure is an empty instrument
//! catalog at startup - with no instrument list there is no work to do.

use crate::catalog::InstrumentCatalog;
use crate::config::Config;
use crate::fanout::UpdateBus;
use crate::signals::SignalProcessor;
use crate::sources::binance_rest::RestSnapshotSource;
use crate::sources::binance_ws::{
    partition_symbols, stream_url, StreamWorker, WsConnector,
};
use crate::sources::terminal_cli::CliSnapshotSource;
use crate::sources::{poller, SnapshotSource};
use crate::store::InstrumentStore;
use crate::signals::rsi::multi_timeframe_rsi;
use crate::utils::types::{
    DataCategory, InstrumentView, SignalBatch, SignalHit, Timeframe, UpdateEvent, UpdateKind,
};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct MarketEngine {
    config: Config,
    catalog: Arc<InstrumentCatalog>,
    store: Arc<InstrumentStore>,
    bus: Arc<UpdateBus>,
    processor: Arc<SignalProcessor>,
    rest: Arc<RestSnapshotSource>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MarketEngine {
    pub fn new(config: Config) -> Self {
        let catalog = Arc::new(InstrumentCatalog::new(
            config.rest.base_url.clone(),
            Duration::from_secs(config.app.catalog_ttl_secs),
            config.rest.request_timeout(),
        ));
        let store = Arc::new(InstrumentStore::new(config.candles.limits.clone()));
        let bus = Arc::new(UpdateBus::new());
        let processor = Arc::new(SignalProcessor::with_default_catalog(&config.signals));
        // the CLI source owns the derivative fields when it runs; otherwise
        // the REST source enriches a bounded subset itself
        let rest = Arc::new(RestSnapshotSource::new(&config.rest, !config.cli.enabled));
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            catalog,
            store,
            bus,
            processor,
            rest,
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Resolve the instrument catalog and start data collection. Catalog
    /// failure is the one error callers must treat as terminal.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut symbols: Vec<String> = self
            .catalog
            .symbols()
            .await
            .context("instrument catalog unavailable")?
            .as_ref()
            .clone();
        if let Some(max) = self.config.app.max_instruments {
            symbols.truncate(max);
        }
        self.start_with_symbols(symbols).await
    }

    /// Start data collection for an explicit instrument list.
    pub async fn start_with_symbols(&self, symbols: Vec<String>) -> anyhow::Result<()> {
        if symbols.is_empty() {
            anyhow::bail!("no instruments to track");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("engine already started");
            return Ok(());
        }
        log::info!("starting data collection for {} instruments", symbols.len());

        let symbols = Arc::new(symbols);
        let mut tasks = Vec::new();

        tasks.push(self.spawn_evaluation_queue());
        tasks.push(self.spawn_sweep());

        if self.config.stream.enabled {
            for group in
                partition_symbols(&symbols, self.config.stream.max_streams_per_connection)
            {
                tasks.push(self.spawn_stream_group(group));
            }
        }

        tasks.push(self.spawn_candle_seed(symbols.clone()));

        tasks.push(poller::spawn(
            self.rest.clone() as Arc<dyn SnapshotSource>,
            self.store.clone(),
            self.bus.clone(),
            symbols.clone(),
            self.config.rest.poll_interval(),
            self.stop_tx.subscribe(),
        ));

        if self.config.cli.enabled {
            let cli = Arc::new(CliSnapshotSource::new(
                &self.config.cli,
                Some(self.rest.clone()),
            ));
            tasks.push(poller::spawn(
                cli as Arc<dyn SnapshotSource>,
                self.store.clone(),
                self.bus.clone(),
                symbols.clone(),
                self.config.cli.poll_interval(),
                self.stop_tx.subscribe(),
            ));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(tasks);
        Ok(())
    }

    /// Serialized evaluation queue: every bus event enqueues its symbol, and a
    /// single task drains the queue running the rule catalog.
    fn spawn_evaluation_queue(&self) -> JoinHandle<()> {
        let (eval_tx, mut eval_rx) = mpsc::unbounded_channel::<String>();
        self.bus.subscribe(
            &[UpdateKind::Tick, UpdateKind::Candle, UpdateKind::Snapshot],
            move |event: &UpdateEvent| {
                let _ = eval_tx.send(event.symbol.clone());
            },
        );

        let store = self.store.clone();
        let processor = self.processor.clone();
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    symbol = eval_rx.recv() => match symbol {
                        | Some(symbol) => {
                            if let Some(view) = store.get(&symbol) {
                                processor.evaluate(&view);
                            }
                        }
                        | None => break,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("signal evaluation queue stopped");
        })
    }

    /// Periodic sweep evaluating every known instrument, covering those that
    /// receive no updates for a while.
    fn spawn_sweep(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let processor = self.processor.clone();
        let mut stop = self.stop_tx.subscribe();
        let sweep_interval = Duration::from_secs(self.config.app.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for symbol in store.symbols() {
                            if let Some(view) = store.get(&symbol) {
                                processor.evaluate(&view);
                            }
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("signal sweep stopped");
        })
    }

    fn spawn_stream_group(&self, group: Vec<String>) -> JoinHandle<()> {
        let url = stream_url(
            &self.config.stream.ws_url,
            &group,
            &self.config.stream.kline_intervals,
        );
        let worker = StreamWorker::new(
            Arc::new(WsConnector::new(url)),
            self.store.clone(),
            self.bus.clone(),
            self.config.stream.reconnect_delay(),
            self.stop_tx.subscribe(),
            group.len(),
        );
        tokio::spawn(worker.run())
    }

    /// One-shot candle history seed over REST, so history-based rules have a
    /// series to work with before the stream has accumulated one.
    fn spawn_candle_seed(&self, symbols: Arc<Vec<String>>) -> JoinHandle<()> {
        let rest = self.rest.clone();
        let store = self.store.clone();
        let bus = self.bus.clone();
        let intervals = self.config.stream.kline_intervals.clone();
        let limits = self.config.candles.limits.clone();
        let mut stop = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut seeded = 0usize;
            for symbol in symbols.iter() {
                if *stop.borrow() {
                    return;
                }
                for tf in &intervals {
                    let limit = limits.get(tf).copied().unwrap_or(500);
                    match rest.fetch_klines(symbol, *tf, limit).await {
                        | Ok(candles) if !candles.is_empty() => {
                            store.replace_candles(symbol, *tf, candles);
                            bus.publish(&UpdateEvent {
                                kind: UpdateKind::Candle,
                                symbol: symbol.clone(),
                                timeframe: Some(*tf),
                            });
                        }
                        | Ok(_) => {}
                        | Err(e) => {
                            log::warn!("candle seed failed for {} {}: {:#}", symbol, tf, e);
                        }
                    }
                }
                seeded += 1;
                // brief pause between instruments to stay inside rate limits
                if seeded % 50 == 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            log::info!("candle history seeded for {} instruments", seeded);
        })
    }

    /// Signal every task to stop. Idempotent: repeated calls and calls on a
    /// never-started engine are no-ops.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for all supervised tasks to wind down after `stop`.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    // --- consumer-facing query surface ---

    /// Point-in-time view of one instrument.
    pub fn instrument(&self, symbol: &str) -> Option<InstrumentView> {
        self.store.get(symbol)
    }

    /// Time since the last successful merge for a data category.
    pub fn data_age(&self, category: DataCategory) -> Option<Duration> {
        self.store.data_age(category)
    }

    /// Register an update subscriber.
    pub fn subscribe<F>(&self, kinds: &[UpdateKind], callback: F)
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kinds, callback);
    }

    /// Latest signal evaluation for one instrument.
    pub fn signals(&self, symbol: &str) -> Vec<SignalHit> {
        self.processor.signals(symbol)
    }

    /// Signal batches recorded within the last `hours` hours.
    pub fn signal_history(&self, hours: i64) -> Vec<SignalBatch> {
        self.processor.history_since(hours)
    }

    /// RSI per timeframe for one instrument, from its stored candle series.
    pub fn rsi(&self, symbol: &str) -> HashMap<Timeframe, f64> {
        self.store
            .get(symbol)
            .map(|view| multi_timeframe_rsi(&view, self.config.signals.rsi_period))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_before_start_is_a_noop() {
        let engine = MarketEngine::new(Config::default());
        engine.stop();
        engine.stop();
        assert!(engine.instrument("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_start_requires_instruments() {
        let engine = MarketEngine::new(Config::default());
        assert!(engine.start_with_symbols(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut config = Config::default();
        config.stream.enabled = false;
        config.cli.enabled = false;
        // point REST at a dead local port so background fetches fail fast
        config.rest.base_url = "http://127.0.0.1:9".to_string();
        config.rest.request_timeout_secs = 1;
        let engine = MarketEngine::new(config);

        engine
            .start_with_symbols(vec!["BTCUSDT".to_string()])
            .await
            .expect("first start");
        // second start is a logged no-op, not an error
        engine
            .start_with_symbols(vec!["BTCUSDT".to_string()])
            .await
            .expect("second start");

        engine.stop();
        engine.join().await;
    }
}
