//! Instrument catalog - resolves the tradable perpetual symbols.
//!
//! The exchange list changes rarely, so it is cached behind a TTL and only
//! re-fetched when stale. A fetch failure with a warm cache serves the stale
//! list; with a cold cache it propagates, since no instrument list means no
//! work can proceed.

use crate::utils::error::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    #[serde(default)]
    status: String,
}

fn perpetual_symbols(info: ExchangeInfo) -> Vec<String> {
    info.symbols
        .into_iter()
        .filter(|s| s.contract_type == "PERPETUAL" && s.status == "TRADING")
        .map(|s| s.symbol)
        .collect()
}

pub struct InstrumentCatalog {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: RwLock<Option<(Instant, Arc<Vec<String>>)>>,
}

impl InstrumentCatalog {
    pub fn new(base_url: impl Into<String>, ttl: Duration, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// The current instrument list, refreshed when the cache is stale.
    pub async fn symbols(&self) -> Result<Arc<Vec<String>>> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, symbols)) = cache.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(symbols.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        // another task may have refreshed while we waited for the write lock
        if let Some((fetched_at, symbols)) = cache.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(symbols.clone());
            }
        }

        match self.fetch().await {
            | Ok(symbols) => {
                log::info!("catalog refreshed: {} perpetual instruments", symbols.len());
                let symbols = Arc::new(symbols);
                *cache = Some((Instant::now(), symbols.clone()));
                Ok(symbols)
            }
            | Err(e) => match cache.as_ref() {
                | Some((_, symbols)) => {
                    log::warn!("catalog refresh failed, serving stale list: {}", e);
                    Ok(symbols.clone())
                }
                | None => Err(Error::CatalogError(format!("initial fetch failed: {}", e))),
            },
        }
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url.trim_end_matches('/'));
        let info: ExchangeInfo = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(perpetual_symbols(info))
    }
}
