//! End-to-end flow tests across the store, fan-out bus and signal processor.

use marketpulse::config::SignalConfig;
use marketpulse::signals::SignalProcessor;
use marketpulse::store::InstrumentStore;
use marketpulse::utils::types::{
    DataCategory, MarketStats, Snapshot, Tick, Timeframe, UpdateEvent, UpdateKind,
};
use marketpulse::fanout::UpdateBus;
use std::collections::HashMap;
use std::sync::Arc;

fn store() -> Arc<InstrumentStore> {
    let mut limits = HashMap::new();
    limits.insert(Timeframe::H1, 168);
    Arc::new(InstrumentStore::new(limits))
}

#[test]
fn near_high_triggers_after_snapshot_then_tick() {
    let store = store();
    let processor = SignalProcessor::with_default_catalog(&SignalConfig::default());

    // snapshot: last_price=100, 24h high=100.5
    store.merge_snapshot(
        "BTCUSDT",
        Snapshot::from_stats(MarketStats {
            last_price: 100.0,
            high_24h: 100.5,
            low_24h: 90.0,
            ..Default::default()
        }),
    );
    // streamed tick at 101: above the recorded high, 101 > 100.5 * 0.99
    store.merge_tick(Tick {
        symbol: "BTCUSDT".to_string(),
        price: 101.0,
        size: 0.5,
        exchange_ts: 1,
    });

    let view = store.get("BTCUSDT").expect("instrument view");
    let hits = processor.evaluate(&view);
    assert!(
        hits.iter().any(|h| h.tag == "near_high"),
        "expected near_high in {:?}",
        hits
    );
}

#[test]
fn bus_driven_evaluation_flow() {
    let store = store();
    let bus = Arc::new(UpdateBus::new());
    let processor = Arc::new(SignalProcessor::with_default_catalog(&SignalConfig::default()));

    // consumer: re-evaluate the instrument on every update, as the engine does
    let eval_store = store.clone();
    let eval_processor = processor.clone();
    bus.subscribe(
        &[UpdateKind::Tick, UpdateKind::Candle, UpdateKind::Snapshot],
        move |event: &UpdateEvent| {
            if let Some(view) = eval_store.get(&event.symbol) {
                eval_processor.evaluate(&view);
            }
        },
    );

    // a producer merges, then publishes, exactly once per data message
    store.merge_snapshot(
        "ETHUSDT",
        Snapshot::from_stats(MarketStats {
            last_price: 2000.0,
            price_change_pct_24h: 12.5,
            high_24h: 2100.0,
            low_24h: 1700.0,
            ..Default::default()
        }),
    );
    bus.publish(&UpdateEvent {
        kind: UpdateKind::Snapshot,
        symbol: "ETHUSDT".to_string(),
        timeframe: None,
    });

    // the 24h move is above the default 10% volatility threshold
    let hits = processor.signals("ETHUSDT");
    assert!(
        hits.iter().any(|h| h.tag == "volatility"),
        "expected volatility in {:?}",
        hits
    );

    // signal history retains the evaluation batch
    let history = processor.history_since(1);
    assert!(history.iter().any(|b| b.symbol == "ETHUSDT"));
}

#[test]
fn data_age_reflects_merges_per_category() {
    let store = store();
    assert!(store.data_age(DataCategory::Snapshot).is_none());

    store.merge_snapshot(
        "BTCUSDT",
        Snapshot::from_stats(MarketStats::default()),
    );
    let age = store.data_age(DataCategory::Snapshot).expect("age after merge");
    assert!(age.as_secs() < 5);

    // other categories stay untracked until their own merges happen
    assert!(store.data_age(DataCategory::Tick).is_none());
    assert!(store.data_age(DataCategory::Candle(Timeframe::H1)).is_none());
}
