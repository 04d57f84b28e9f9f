//! Wilder RSI over candle closes, computed with the `ta` crate.

use crate::utils::types::{InstrumentView, Timeframe};
use std::collections::HashMap;
use ta::indicators::RelativeStrengthIndex;
use ta::Next;

/// RSI reported when a series is too short to compute one.
pub const NEUTRAL_RSI: f64 = 50.0;

/// RSI of the final close in the series. Returns [`NEUTRAL_RSI`] when fewer
/// than `period + 1` closes are available.
pub fn rsi_from_closes(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return NEUTRAL_RSI;
    }
    let mut rsi = match RelativeStrengthIndex::new(period) {
        | Ok(rsi) => rsi,
        | Err(_) => return NEUTRAL_RSI,
    };
    let mut value = NEUTRAL_RSI;
    for &close in closes {
        value = rsi.next(close);
    }
    value
}

/// RSI per timeframe for every series the view holds.
pub fn multi_timeframe_rsi(view: &InstrumentView, period: usize) -> HashMap<Timeframe, f64> {
    view.candles
        .iter()
        .map(|(tf, series)| {
            let closes: Vec<f64> = series.iter().map(|c| c.close).collect();
            (*tf, rsi_from_closes(&closes, period))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_series_is_neutral() {
        assert_eq!(rsi_from_closes(&[100.0, 101.0], 14), NEUTRAL_RSI);
        assert_eq!(rsi_from_closes(&[], 14), NEUTRAL_RSI);
    }

    #[test]
    fn test_monotonic_gains_push_rsi_high() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let rsi = rsi_from_closes(&closes, 14);
        assert!(rsi > 90.0, "all-gain series should be strongly overbought, got {}", rsi);
    }

    #[test]
    fn test_monotonic_losses_push_rsi_low() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64 * 0.5).collect();
        let rsi = rsi_from_closes(&closes, 14);
        assert!(rsi < 10.0, "all-loss series should be strongly oversold, got {}", rsi);
    }
}
