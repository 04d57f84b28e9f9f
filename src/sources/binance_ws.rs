//! Streaming source adapter.
//!
//! Each connection group owns one combined-stream subscription and an
//! independent reconnect state machine:
//! `Disconnected -> Connecting -> Subscribed -> Disconnected` in a loop, with
//! `Stopped` reachable only from the external stop signal. A fixed delay
//! separates a disconnect from the next attempt, and every reconnect re-issues
//! the full subscription via the stream URL. Malformed messages are logged and
//! skipped; only connection-level failures trigger a reconnect.
//!
//! Instrument sets larger than the per-connection cap are partitioned into
//! balanced groups, each with its own connection, so one group's failure never
//! affects another.

use crate::fanout::UpdateBus;
use crate::store::InstrumentStore;
use crate::utils::types::{Candle, Tick, Timeframe, UpdateEvent, UpdateKind};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Connection state of one stream group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Subscribed,
    Stopped,
}

/// One live feed connection, yielding text payloads. Control frames are
/// handled internally; `None` means the server closed the connection.
#[async_trait]
pub trait FeedConnection: Send {
    async fn next_text(&mut self) -> Option<anyhow::Result<String>>;
}

/// Connection factory, one per stream group. The production implementation
/// dials the exchange; tests substitute a scripted connector.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn FeedConnection>>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn FeedConnection>> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        Ok(Box::new(WsConnection { inner: ws_stream }))
    }
}

struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn next_text(&mut self) -> Option<anyhow::Result<String>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                | Ok(Message::Text(txt)) => return Some(Ok(txt)),
                | Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                | Ok(Message::Close(_)) => return None,
                | Ok(_) => {}
                | Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}

/// Build the combined-stream URL for one symbol group: an aggTrade stream per
/// symbol plus a kline stream per configured interval.
pub fn stream_url(base: &str, symbols: &[String], kline_intervals: &[Timeframe]) -> String {
    let mut streams = Vec::with_capacity(symbols.len() * (1 + kline_intervals.len()));
    for symbol in symbols {
        let lower = symbol.to_lowercase();
        streams.push(format!("{}@aggTrade", lower));
        for tf in kline_intervals {
            streams.push(format!("{}@kline_{}", lower, tf.as_str()));
        }
    }
    format!("{}?streams={}", base.trim_end_matches('/'), streams.join("/"))
}

/// Split an instrument set into balanced groups of at most `max_per_conn`.
pub fn partition_symbols(symbols: &[String], max_per_conn: usize) -> Vec<Vec<String>> {
    if symbols.is_empty() || max_per_conn == 0 {
        return Vec::new();
    }
    let groups = (symbols.len() + max_per_conn - 1) / max_per_conn;
    let per_group = (symbols.len() + groups - 1) / groups;
    symbols.chunks(per_group).map(|c| c.to_vec()).collect()
}

/// Reconnecting worker for one connection group.
pub struct StreamWorker {
    connector: Arc<dyn FeedConnector>,
    store: Arc<InstrumentStore>,
    bus: Arc<UpdateBus>,
    reconnect_delay: Duration,
    stop: watch::Receiver<bool>,
    state: Arc<Mutex<ConnState>>,
    group_size: usize,
}

impl StreamWorker {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        store: Arc<InstrumentStore>,
        bus: Arc<UpdateBus>,
        reconnect_delay: Duration,
        stop: watch::Receiver<bool>,
        group_size: usize,
    ) -> Self {
        Self {
            connector,
            store,
            bus,
            reconnect_delay,
            stop,
            state: Arc::new(Mutex::new(ConnState::Disconnected)),
            group_size,
        }
    }

    /// Shared handle observing this worker's connection state.
    pub fn state_handle(&self) -> Arc<Mutex<ConnState>> {
        self.state.clone()
    }

    fn set_state(&self, state: ConnState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run until stopped. Connection failures loop back through the fixed
    /// reconnect delay; the stop signal wins every race.
    pub async fn run(mut self) {
        loop {
            if self.stopped() {
                break;
            }
            self.set_state(ConnState::Connecting);

            let connected = tokio::select! {
                res = self.connector.connect() => res,
                _ = wait_for_stop(&mut self.stop) => break,
            };
            match connected {
                | Ok(mut conn) => {
                    self.set_state(ConnState::Subscribed);
                    log::info!("stream group of {} instruments subscribed", self.group_size);
                    loop {
                        tokio::select! {
                            msg = conn.next_text() => match msg {
                                | Some(Ok(text)) => self.handle_message(&text),
                                | Some(Err(e)) => {
                                    log::warn!("stream read error: {:#}", e);
                                    break;
                                }
                                | None => {
                                    log::warn!("stream closed by server");
                                    break;
                                }
                            },
                            _ = wait_for_stop(&mut self.stop) => {
                                self.set_state(ConnState::Stopped);
                                return;
                            }
                        }
                    }
                    self.set_state(ConnState::Disconnected);
                }
                | Err(e) => {
                    log::warn!("stream connect failed: {:#}", e);
                    self.set_state(ConnState::Disconnected);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = wait_for_stop(&mut self.stop) => break,
            }
        }
        self.set_state(ConnState::Stopped);
        log::info!("stream group of {} instruments stopped", self.group_size);
    }

    /// Decode one inbound frame. Acks are consumed, malformed frames are
    /// skipped, and every decoded data message results in exactly one store
    /// merge and one fan-out notification.
    fn handle_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            | Ok(v) => v,
            | Err(e) => {
                log::debug!("skipping undecodable frame: {}", e);
                return;
            }
        };

        // subscription ack / control response
        if value.get("result").is_some() || value.get("id").is_some() {
            log::debug!("subscription ack consumed");
            return;
        }

        let data = value.get("data").unwrap_or(&value);
        match data.get("e").and_then(|v| v.as_str()) {
            | Some("aggTrade") => self.handle_agg_trade(data),
            | Some("kline") => self.handle_kline(data),
            | Some(other) => log::debug!("ignoring unrecognized event type {}", other),
            | None => log::debug!("ignoring message without event type"),
        }
    }

    fn handle_agg_trade(&self, data: &Value) {
        let event: AggTradeEvent = match serde_json::from_value(data.clone()) {
            | Ok(e) => e,
            | Err(e) => {
                log::debug!("skipping malformed aggTrade: {}", e);
                return;
            }
        };
        let (Ok(price), Ok(size)) = (event.price.parse::<f64>(), event.quantity.parse::<f64>())
        else {
            log::debug!("skipping aggTrade with non-numeric fields for {}", event.symbol);
            return;
        };

        let symbol = event.symbol.clone();
        self.store.merge_tick(Tick {
            symbol: event.symbol,
            price,
            size,
            exchange_ts: event.trade_time,
        });
        self.bus.publish(&UpdateEvent { kind: UpdateKind::Tick, symbol, timeframe: None });
    }

    fn handle_kline(&self, data: &Value) {
        let event: KlineEvent = match serde_json::from_value(data.clone()) {
            | Ok(e) => e,
            | Err(e) => {
                log::debug!("skipping malformed kline: {}", e);
                return;
            }
        };
        let Some(tf) = Timeframe::parse(&event.kline.interval) else {
            log::debug!("ignoring kline with unknown interval {}", event.kline.interval);
            return;
        };
        let Some(candle) = event.kline.to_candle() else {
            log::debug!("skipping kline with non-numeric fields for {}", event.symbol);
            return;
        };

        self.store.merge_candle(&event.symbol, tf, candle);
        self.bus.publish(&UpdateEvent {
            kind: UpdateKind::Candle,
            symbol: event.symbol,
            timeframe: Some(tf),
        });
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        // sender dropped counts as a stop
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
}

impl KlinePayload {
    fn to_candle(&self) -> Option<Candle> {
        Some(Candle {
            open_time: self.open_time,
            open: self.open.parse().ok()?,
            high: self.high.parse().ok()?,
            low: self.low.parse().ok()?,
            close: self.close.parse().ok()?,
            volume: self.volume.parse().ok()?,
            quote_volume: self.quote_volume.parse().ok()?,
            trade_count: self.trade_count,
            close_time: self.close_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Connector that fails a scripted number of times, then hands out a
    /// connection that stays silent until the worker is stopped.
    struct ScriptedConnector {
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn connect(&self) -> anyhow::Result<Box<dyn FeedConnection>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("simulated connect failure {}", attempt + 1)
            }
            Ok(Box::new(SilentConnection))
        }
    }

    struct SilentConnection;

    #[async_trait]
    impl FeedConnection for SilentConnection {
        async fn next_text(&mut self) -> Option<anyhow::Result<String>> {
            // keep the connection open until the worker stops us
            std::future::pending().await
        }
    }

    fn worker_harness(
        connector: Arc<dyn FeedConnector>,
        delay: Duration,
    ) -> (StreamWorker, watch::Sender<bool>, Arc<Mutex<ConnState>>) {
        let store = Arc::new(InstrumentStore::new(HashMap::new()));
        let bus = Arc::new(UpdateBus::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = StreamWorker::new(connector, store, bus, delay, stop_rx, 1);
        let state = worker.state_handle();
        (worker, stop_tx, state)
    }

    fn data_worker() -> (StreamWorker, Arc<InstrumentStore>, Arc<UpdateBus>, Arc<AtomicUsize>) {
        let store = Arc::new(InstrumentStore::new(HashMap::new()));
        let bus = Arc::new(UpdateBus::new());
        let published = Arc::new(AtomicUsize::new(0));
        let counter = published.clone();
        bus.subscribe(&[UpdateKind::Tick, UpdateKind::Candle], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (_stop_tx, stop_rx) = watch::channel(false);
        let connector = Arc::new(ScriptedConnector { failures: 0, attempts: Arc::new(AtomicUsize::new(0)) });
        let worker = StreamWorker::new(connector, store.clone(), bus.clone(), Duration::from_secs(5), stop_rx, 1);
        (worker, store, bus, published)
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_failures_mean_n_plus_one_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(ScriptedConnector { failures: 3, attempts: attempts.clone() });
        let delay = Duration::from_secs(5);
        let (worker, stop_tx, state) = worker_harness(connector, delay);

        let started = Instant::now();
        let handle = tokio::spawn(worker.run());

        // 3 failures separated by the fixed delay, then a successful attempt
        tokio::time::advance(delay * 3 + Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*state.lock().unwrap(), ConnState::Subscribed);
        // the three delays actually elapsed
        assert!(started.elapsed() >= delay * 3);

        // never Stopped until explicitly told to
        stop_tx.send(true).expect("stop");
        handle.await.expect("join");
        assert_eq!(*state.lock().unwrap(), ConnState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_reconnect_delay() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(ScriptedConnector { failures: usize::MAX, attempts: attempts.clone() });
        let (worker, stop_tx, state) = worker_harness(connector, Duration::from_secs(5));

        let handle = tokio::spawn(worker.run());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // stop while the worker is sleeping out the reconnect delay
        stop_tx.send(true).expect("stop");
        handle.await.expect("join");
        assert_eq!(*state.lock().unwrap(), ConnState::Stopped);
        // no further attempts after stop
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_partition_symbols_balanced() {
        let symbols: Vec<String> = (0..5).map(|i| format!("SYM{}", i)).collect();

        let groups = partition_symbols(&symbols, 2);
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() <= 2));
        assert_eq!(groups.iter().map(|g| g.len()).sum::<usize>(), 5);

        // under the cap: a single group
        let groups = partition_symbols(&symbols, 200);
        assert_eq!(groups.len(), 1);

        assert!(partition_symbols(&[], 200).is_empty());
    }

    #[test]
    fn test_stream_url_contains_all_streams() {
        let url = stream_url(
            "wss://example.test/stream",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &[Timeframe::M1, Timeframe::H1],
        );
        assert!(url.starts_with("wss://example.test/stream?streams="));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("ethusdt@kline_1h"));
    }

    #[test]
    fn test_agg_trade_message_merges_and_publishes() {
        let (worker, store, _bus, published) = data_worker();
        let frame = r#"{
            "stream": "btcusdt@aggTrade",
            "data": {"e":"aggTrade","E":1623262423000,"s":"BTCUSDT","a":101,"p":"42000.5","q":"0.25","T":1623262422000,"m":false}
        }"#;
        worker.handle_message(frame);

        let view = store.get("BTCUSDT").expect("instrument");
        let tick = view.last_tick.expect("tick");
        assert_eq!(tick.price, 42000.5);
        assert_eq!(tick.size, 0.25);
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kline_message_merges_and_publishes() {
        let (worker, store, _bus, published) = data_worker();
        let frame = r#"{
            "stream": "btcusdt@kline_1h",
            "data": {"e":"kline","E":1623262423000,"s":"BTCUSDT","k":{
                "t":1623260400000,"T":1623263999999,"s":"BTCUSDT","i":"1h","f":100,"L":200,
                "o":"41000.0","c":"42000.0","h":"42100.0","l":"40900.0","v":"1000.0","n":500,
                "x":false,"q":"41500000.0","V":"500.0","Q":"20750000.0","B":"0"
            }}
        }"#;
        worker.handle_message(frame);

        let view = store.get("BTCUSDT").expect("instrument");
        let series = view.series(Timeframe::H1);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].close, 42000.0);
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acks_and_garbage_are_consumed_silently() {
        let (worker, store, _bus, published) = data_worker();

        worker.handle_message(r#"{"result": null, "id": 1}"#);
        worker.handle_message("not json at all");
        worker.handle_message(r#"{"data": {"e": "mysteryEvent"}}"#);
        worker.handle_message(r#"{"data": {"e":"aggTrade","s":"BTCUSDT","p":"oops","q":"1","T":0}}"#);

        assert!(store.is_empty());
        assert_eq!(published.load(Ordering::SeqCst), 0);
    }
}
