//! CLI-derived snapshot source.
//!
//! Invokes the external terminal CLI as a subprocess with a bounded timeout;
//! success is exit code zero plus well-formed JSON on stdout, anything else is
//! a recoverable per-cycle failure. Symbols missing from the CLI output are
//! back-filled one by one over the slower REST path, bounded by the configured
//! fallback cap - the overflow is deferred to the next cycle.

use crate::config::CliConfig;
use crate::sources::binance_rest::RestSnapshotSource;
use crate::sources::SnapshotSource;
use crate::utils::types::{DerivativeStats, Snapshot};
use anyhow::{bail, Context};
use async_trait::async_trait;
use metrics::histogram;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Deserialize)]
struct CliRecord {
    symbol: String,
    #[serde(rename = "tickCount")]
    tick_count: Option<u64>,
    #[serde(rename = "fundingRate")]
    funding_rate: Option<f64>,
    #[serde(rename = "openInterest")]
    open_interest: Option<f64>,
}

pub struct CliSnapshotSource {
    command: Vec<String>,
    timeout: std::time::Duration,
    fallback: Option<Arc<RestSnapshotSource>>,
    fallback_limit: usize,
}

impl CliSnapshotSource {
    pub fn new(config: &CliConfig, fallback: Option<Arc<RestSnapshotSource>>) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
            fallback,
            fallback_limit: config.fallback_limit,
        }
    }

    async fn run_cli(&self) -> anyhow::Result<Vec<CliRecord>> {
        let (program, args) = self
            .command
            .split_first()
            .context("cli command is empty")?;

        let start = std::time::Instant::now();
        let output = timeout(
            self.timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("cli timed out after {:?}", self.timeout))?
        .with_context(|| format!("failed to spawn {}", program))?;
        histogram!("marketpulse_cli_fetch_ms", start.elapsed().as_millis() as f64);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("cli exited with {}: {}", output.status, stderr.trim());
        }

        let records: Vec<CliRecord> =
            serde_json::from_slice(&output.stdout).context("cli produced malformed JSON")?;
        log::debug!("cli returned {} perpetual records", records.len());
        Ok(records)
    }
}

#[async_trait]
impl SnapshotSource for CliSnapshotSource {
    fn name(&self) -> &'static str {
        "terminal-cli"
    }

    async fn fetch(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, Snapshot>> {
        let records = self.run_cli().await?;
        let by_symbol: HashMap<String, CliRecord> =
            records.into_iter().map(|r| (r.symbol.clone(), r)).collect();

        let mut snapshots = HashMap::new();
        let mut missing = Vec::new();
        for symbol in symbols {
            match by_symbol.get(symbol) {
                | Some(record) => {
                    snapshots.insert(
                        symbol.clone(),
                        Snapshot::from_derivs(DerivativeStats {
                            open_interest: record.open_interest,
                            funding_rate: record.funding_rate,
                            tick_count: record.tick_count,
                        }),
                    );
                }
                | None => missing.push(symbol),
            }
        }

        if !missing.is_empty() {
            if let Some(rest) = &self.fallback {
                let take = missing.len().min(self.fallback_limit);
                if missing.len() > take {
                    log::warn!(
                        "cli missing {} symbols, backfilling {} now and deferring {}",
                        missing.len(),
                        take,
                        missing.len() - take
                    );
                } else {
                    log::warn!("cli missing {} symbols, using REST backfill", missing.len());
                }
                // sequential per-symbol requests: cost is O(missing), which is
                // why the set is capped above
                for symbol in &missing[..take] {
                    let derivs = rest.derivative_stats(symbol).await;
                    snapshots.insert((*symbol).clone(), Snapshot::from_derivs(derivs));
                }
            } else {
                log::warn!("cli returned no data for {} symbols, no fallback configured", missing.len());
            }
        }

        Ok(snapshots)
    }
}
