//! Signal processor - runs the rule catalog over instrument views.
//!
//! Rules are evaluated in registration order and every firing rule is
//! reported; there is no single-winner suppression. A rule that errors or
//! panics is logged and treated as not-triggered for that rule, instrument
//! and cycle only - the rest of the catalog still runs.

use crate::config::SignalConfig;
use crate::signals::rules::{default_catalog, SignalRule};
use crate::utils::types::{InstrumentView, SignalBatch, SignalHit};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

pub struct SignalProcessor {
    rules: Vec<Box<dyn SignalRule>>,
    latest: DashMap<String, Vec<SignalHit>>,
    history: Mutex<VecDeque<SignalBatch>>,
    history_cap: usize,
}

impl SignalProcessor {
    /// Processor with the default rule catalog built from configured thresholds.
    pub fn with_default_catalog(config: &SignalConfig) -> Self {
        Self {
            rules: default_catalog(config),
            latest: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_cap: config.history_cap,
        }
    }

    /// Processor with an explicit rule set (evaluated in the given order).
    pub fn with_rules(rules: Vec<Box<dyn SignalRule>>, history_cap: usize) -> Self {
        Self {
            rules,
            latest: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_cap,
        }
    }

    /// Append a rule to the end of the catalog.
    pub fn register(&mut self, rule: Box<dyn SignalRule>) {
        self.rules.push(rule);
    }

    /// Run the full catalog for one instrument and record the result.
    pub fn evaluate(&self, view: &InstrumentView) -> Vec<SignalHit> {
        let mut hits = Vec::new();
        for rule in &self.rules {
            match catch_unwind(AssertUnwindSafe(|| rule.evaluate(view))) {
                | Ok(Ok(Some(hit))) => hits.push(hit),
                | Ok(Ok(None)) => {}
                | Ok(Err(e)) => {
                    log::warn!("rule {} failed for {}: {:#}", rule.name(), view.symbol, e);
                }
                | Err(_) => {
                    log::error!("rule {} panicked for {}", rule.name(), view.symbol);
                }
            }
        }

        let changed = self
            .latest
            .get(&view.symbol)
            .map(|prev| *prev != hits)
            .unwrap_or(!hits.is_empty());
        if changed && !hits.is_empty() {
            let tags: Vec<&str> = hits.iter().map(|h| h.tag.as_str()).collect();
            log::info!("{}: signals {:?}", view.symbol, tags);
        }

        self.latest.insert(view.symbol.clone(), hits.clone());
        self.record(SignalBatch { symbol: view.symbol.clone(), hits: hits.clone(), at: Utc::now() });
        hits
    }

    fn record(&self, batch: SignalBatch) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(batch);
        while history.len() > self.history_cap {
            history.pop_front();
        }
    }

    /// Latest evaluation result for one instrument.
    pub fn signals(&self, symbol: &str) -> Vec<SignalHit> {
        self.latest.get(symbol).map(|hits| hits.clone()).unwrap_or_default()
    }

    /// Evaluation batches recorded within the last `hours` hours.
    pub fn history_since(&self, hours: i64) -> Vec<SignalBatch> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.iter().filter(|b| b.at >= cutoff).cloned().collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
