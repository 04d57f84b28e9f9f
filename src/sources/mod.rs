//! Market data source adapters - streaming, REST polling and CLI polling.

pub mod binance_rest;
pub mod binance_ws;
pub mod poller;
pub mod terminal_cli;

use crate::utils::types::Snapshot;
use async_trait::async_trait;
use std::collections::HashMap;

/// Trait implemented by any source that can produce a full snapshot for a set
/// of instruments. A returned map missing a requested symbol means "no data
/// for that symbol this cycle"; transport and decode failures are `Err` and
/// are therefore distinguishable from absent instruments.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, Snapshot>>;
}
