//! REST snapshot source - bulk 24h ticker statistics plus single-symbol
//! open-interest and funding-rate lookups used by the fallback path.

use crate::config::RestConfig;
use crate::sources::SnapshotSource;
use crate::utils::types::{Candle, DerivativeStats, MarketStats, Snapshot, Timeframe};
use async_trait::async_trait;
use metrics::histogram;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// The exchange reports most numeric ticker fields as strings.
#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "priceChangePercent", default)]
    price_change_percent: String,
    #[serde(rename = "lastPrice", default)]
    last_price: String,
    #[serde(rename = "openPrice", default)]
    open_price: String,
    #[serde(rename = "highPrice", default)]
    high_price: String,
    #[serde(rename = "lowPrice", default)]
    low_price: String,
    #[serde(rename = "volume", default)]
    volume: String,
    #[serde(rename = "quoteVolume", default)]
    quote_volume: String,
    #[serde(rename = "count", default)]
    count: u64,
}

fn parse_price(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

fn market_stats_from(ticker: &Ticker24h) -> MarketStats {
    MarketStats {
        last_price: parse_price(&ticker.last_price),
        price_change_pct_24h: parse_price(&ticker.price_change_percent),
        open_price_24h: parse_price(&ticker.open_price),
        high_24h: parse_price(&ticker.high_price),
        low_24h: parse_price(&ticker.low_price),
        volume_24h: parse_price(&ticker.volume),
        quote_volume_24h: parse_price(&ticker.quote_volume),
        trade_count_24h: ticker.count,
    }
}

/// Decode one kline row (a JSON array) into a candle. Returns `None` on any
/// shape mismatch so one bad row never fails the whole series.
fn candle_from_row(row: &[Value]) -> Option<Candle> {
    let as_f64 = |v: &Value| -> Option<f64> {
        v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64())
    };
    Some(Candle {
        open_time: row.first()?.as_i64()?,
        open: as_f64(row.get(1)?)?,
        high: as_f64(row.get(2)?)?,
        low: as_f64(row.get(3)?)?,
        close: as_f64(row.get(4)?)?,
        volume: as_f64(row.get(5)?)?,
        close_time: row.get(6)?.as_i64()?,
        quote_volume: as_f64(row.get(7)?)?,
        trade_count: row.get(8)?.as_u64()?,
    })
}

pub struct RestSnapshotSource {
    client: reqwest::Client,
    base_url: String,
    /// When this source owns the derivative fields (no CLI source running),
    /// up to `derivs_limit` symbols get open-interest/funding enrichment per
    /// cycle. Kept false when the CLI source runs, so the two sources never
    /// write the same fields.
    enrich_derivs: bool,
    derivs_limit: usize,
}

impl RestSnapshotSource {
    pub fn new(config: &RestConfig, enrich_derivs: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            enrich_derivs,
            derivs_limit: config.derivs_limit,
        }
    }

    /// Candle history for one symbol and timeframe.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        tf: Timeframe,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let limit = limit.to_string();
        let rows: Vec<Vec<Value>> = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("interval", tf.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let total = rows.len();
        let candles: Vec<Candle> = rows.iter().filter_map(|r| candle_from_row(r)).collect();
        if candles.len() < total {
            log::warn!(
                "{} {}: skipped {} malformed kline rows",
                symbol,
                tf,
                total - candles.len()
            );
        }
        Ok(candles)
    }

    /// Current open interest for one symbol.
    pub async fn open_interest(&self, symbol: &str) -> anyhow::Result<f64> {
        #[derive(Deserialize)]
        struct OpenInterest {
            #[serde(rename = "openInterest")]
            open_interest: String,
        }
        let url = format!("{}/fapi/v1/openInterest", self.base_url);
        let body: OpenInterest = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.open_interest
            .parse()
            .map_err(|e| anyhow::anyhow!("bad openInterest value: {}", e))
    }

    /// Most recent funding rate for one symbol.
    pub async fn funding_rate(&self, symbol: &str) -> anyhow::Result<f64> {
        #[derive(Deserialize)]
        struct FundingRate {
            #[serde(rename = "fundingRate")]
            funding_rate: String,
        }
        let url = format!("{}/fapi/v1/fundingRate", self.base_url);
        let body: Vec<FundingRate> = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let latest = body
            .first()
            .ok_or_else(|| anyhow::anyhow!("no funding rate returned for {}", symbol))?;
        latest
            .funding_rate
            .parse()
            .map_err(|e| anyhow::anyhow!("bad fundingRate value: {}", e))
    }

    /// Derivative stats for one symbol, used to back-fill instruments the CLI
    /// source returned nothing for. Each leg tolerates its own failure.
    pub async fn derivative_stats(&self, symbol: &str) -> DerivativeStats {
        let open_interest = match self.open_interest(symbol).await {
            | Ok(oi) => Some(oi),
            | Err(e) => {
                log::debug!("open interest unavailable for {}: {:#}", symbol, e);
                None
            }
        };
        let funding_rate = match self.funding_rate(symbol).await {
            | Ok(rate) => Some(rate),
            | Err(e) => {
                log::debug!("funding rate unavailable for {}: {:#}", symbol, e);
                None
            }
        };
        DerivativeStats { open_interest, funding_rate, tick_count: None }
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    fn name(&self) -> &'static str {
        "binance-rest"
    }

    async fn fetch(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, Snapshot>> {
        let wanted: HashSet<&str> = symbols.iter().map(|s| s.as_str()).collect();
        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);

        let start = std::time::Instant::now();
        let tickers: Vec<Ticker24h> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        histogram!("marketpulse_rest_fetch_ms", start.elapsed().as_millis() as f64);

        let mut snapshots: HashMap<String, Snapshot> = tickers
            .into_iter()
            .filter(|t| wanted.contains(t.symbol.as_str()))
            .map(|t| {
                let stats = market_stats_from(&t);
                (t.symbol, Snapshot::from_stats(stats))
            })
            .collect();

        if self.enrich_derivs {
            let enriched: Vec<String> = symbols
                .iter()
                .filter(|s| snapshots.contains_key(*s))
                .take(self.derivs_limit)
                .cloned()
                .collect();
            for symbol in &enriched {
                let derivs = self.derivative_stats(symbol).await;
                if let Some(snapshot) = snapshots.get_mut(symbol) {
                    snapshot.derivs = Some(derivs);
                }
            }
        }

        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_mapping() {
        let ticker: Ticker24h = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "priceChange": "-94.99999800",
                "priceChangePercent": "-95.960",
                "weightedAvgPrice": "0.29628482",
                "lastPrice": "4.00000200",
                "lastQty": "200.00000000",
                "openPrice": "99.00000000",
                "highPrice": "100.00000000",
                "lowPrice": "0.10000000",
                "volume": "8913.30000000",
                "quoteVolume": "15.30000000",
                "openTime": 1499783499040,
                "closeTime": 1499869899040,
                "firstId": 28385,
                "lastId": 28460,
                "count": 76
            }"#,
        )
        .expect("parse ticker");

        let stats = market_stats_from(&ticker);
        assert_eq!(stats.last_price, 4.000002);
        assert_eq!(stats.price_change_pct_24h, -95.96);
        assert_eq!(stats.high_24h, 100.0);
        assert_eq!(stats.low_24h, 0.1);
        assert_eq!(stats.trade_count_24h, 76);
    }

    #[test]
    fn test_candle_from_row() {
        let row: Vec<Value> = serde_json::from_str(
            r#"[
                1499040000000,
                "0.01634790",
                "0.80000000",
                "0.01575800",
                "0.01577100",
                "148976.11427815",
                1499644799999,
                "2434.19055334",
                308,
                "1756.87402397",
                "28.46694368",
                "17928899.62484339"
            ]"#,
        )
        .expect("parse row");

        let candle = candle_from_row(&row).expect("candle");
        assert_eq!(candle.open_time, 1499040000000);
        assert_eq!(candle.open, 0.0163479);
        assert_eq!(candle.close, 0.015771);
        assert_eq!(candle.quote_volume, 2434.19055334);
        assert_eq!(candle.trade_count, 308);
    }

    #[test]
    fn test_candle_from_malformed_row() {
        let row: Vec<Value> = serde_json::from_str(r#"[1499040000000, "not-a-number"]"#).expect("parse");
        assert!(candle_from_row(&row).is_none());
    }
}
