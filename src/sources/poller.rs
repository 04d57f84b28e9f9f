//! Periodic polling scheduler for snapshot sources.
//!
//! One independent timer per adapter: the first fetch runs immediately at
//! startup, then on every interval tick. The fetch is awaited inline and
//! missed ticks are skipped, so overlapping fetches for the same adapter
//! cannot happen and snapshot replacement stays ordered. A failed fetch is
//! logged and retried on the next tick - it never stops the loop and never
//! affects other adapters.

use crate::fanout::UpdateBus;
use crate::sources::SnapshotSource;
use crate::store::InstrumentStore;
use crate::utils::types::{UpdateEvent, UpdateKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawn the polling loop for one snapshot source.
pub fn spawn(
    source: Arc<dyn SnapshotSource>,
    store: Arc<InstrumentStore>,
    bus: Arc<UpdateBus>,
    symbols: Arc<Vec<String>>,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("{}: polling every {:?}", source.name(), poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_cycle(source.as_ref(), &store, &bus, &symbols).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("{}: poller stopped", source.name());
    })
}

async fn run_cycle(
    source: &dyn SnapshotSource,
    store: &InstrumentStore,
    bus: &UpdateBus,
    symbols: &[String],
) {
    match source.fetch(symbols).await {
        | Ok(snapshots) => {
            let missing = symbols.iter().filter(|s| !snapshots.contains_key(*s)).count();
            if missing > 0 {
                // absent instruments keep their previous snapshot
                log::debug!("{}: no data for {} of {} instruments", source.name(), missing, symbols.len());
            }
            let merged = snapshots.len();
            for (symbol, snapshot) in snapshots {
                store.merge_snapshot(&symbol, snapshot);
                bus.publish(&UpdateEvent {
                    kind: UpdateKind::Snapshot,
                    symbol,
                    timeframe: None,
                });
            }
            log::info!("{}: refreshed {} instruments", source.name(), merged);
        }
        | Err(e) => {
            log::warn!("{}: fetch failed, retrying next tick: {:#}", source.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{MarketStats, Snapshot};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SnapshotSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, Snapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(symbols
                .iter()
                .map(|s| {
                    (
                        s.clone(),
                        Snapshot::from_stats(MarketStats { last_price: 100.0, ..Default::default() }),
                    )
                })
                .collect())
        }
    }

    struct FailingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SnapshotSource for FailingSource {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn fetch(&self, _symbols: &[String]) -> anyhow::Result<HashMap<String, Snapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("source is down")
        }
    }

    fn harness() -> (Arc<InstrumentStore>, Arc<UpdateBus>, Arc<Vec<String>>) {
        (
            Arc::new(InstrumentStore::new(HashMap::new())),
            Arc::new(UpdateBus::new()),
            Arc::new(vec!["BTCUSDT".to_string()]),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fetch_runs_at_startup() {
        let (store, bus, symbols) = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(
            Arc::new(CountingSource { calls: calls.clone() }),
            store.clone(),
            bus,
            symbols,
            Duration::from_secs(60),
            stop_rx,
        );

        // no interval needs to elapse for the first cycle
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.get("BTCUSDT").is_some());

        stop_tx.send(true).expect("stop");
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_adapter_does_not_affect_other_adapter() {
        let (store, bus, symbols) = harness();
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let counting_calls = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let failing = spawn(
            Arc::new(FailingSource { calls: failing_calls.clone() }),
            store.clone(),
            bus.clone(),
            symbols.clone(),
            Duration::from_secs(10),
            stop_rx.clone(),
        );
        let counting = spawn(
            Arc::new(CountingSource { calls: counting_calls.clone() }),
            store.clone(),
            bus,
            symbols,
            Duration::from_secs(10),
            stop_rx,
        );

        tokio::time::advance(Duration::from_secs(35)).await;

        // both ran their startup fetch plus three interval ticks
        assert_eq!(failing_calls.load(Ordering::SeqCst), 4);
        assert_eq!(counting_calls.load(Ordering::SeqCst), 4);
        // the healthy adapter kept updating the store
        assert!(store.get("BTCUSDT").is_some());

        stop_tx.send(true).expect("stop");
        failing.await.expect("join");
        counting.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (store, bus, symbols) = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(
            Arc::new(CountingSource { calls: calls.clone() }),
            store,
            bus,
            symbols,
            Duration::from_secs(10),
            stop_rx,
        );

        tokio::time::advance(Duration::from_millis(10)).await;
        stop_tx.send(true).expect("stop");
        // stopping again is a no-op
        stop_tx.send(true).expect("stop again");
        handle.await.expect("join");

        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
