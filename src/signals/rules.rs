//! The rule catalog evaluated against instrument views.
//!
//! Each rule is an independent check: given a point-in-time view it either
//! triggers with a tag and detail or stays silent. Rules never mutate store
//! state, and a rule that lacks the history it needs reports "not triggered"
//! rather than erroring.

use crate::config::SignalConfig;
use crate::signals::basic::{
    detect_funding_anomaly, detect_near_extremes, detect_oi_jump, detect_price_momentum,
    detect_tick_spike, detect_volatility, detect_volume_spike, Direction, ExtremeSide,
};
use crate::utils::types::{InstrumentView, SignalHit, Timeframe};
use anyhow::Result;

/// One pluggable signal rule.
pub trait SignalRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>>;
}

/// Build the default catalog from configured thresholds.
/// Registration order here is the reporting order.
pub fn default_catalog(config: &SignalConfig) -> Vec<Box<dyn SignalRule>> {
    vec![
        Box::new(VolumeSpikeRule {
            threshold: config.volume_spike_threshold,
            lookback: config.volume_lookback,
        }),
        Box::new(PriceMomentumRule { threshold_pct: config.momentum_threshold_pct }),
        Box::new(VolatilityRule { threshold_pct: config.volatility_threshold_pct }),
        Box::new(NearExtremeRule { threshold: config.near_extreme_threshold }),
        Box::new(FundingAnomalyRule { threshold: config.funding_threshold }),
        Box::new(OiJumpRule { threshold: config.oi_jump_threshold }),
        Box::new(StairStepRule { run: config.stair_step_run }),
        Box::new(RangeBreakRule {
            lookback: config.range_break_lookback,
            margin: config.range_break_margin,
        }),
        Box::new(TickSpikeRule { threshold_pct: config.tick_spike_threshold_pct }),
    ]
}

/// Current 1h volume vs the trailing average over the lookback window.
pub struct VolumeSpikeRule {
    pub threshold: f64,
    pub lookback: usize,
}

impl SignalRule for VolumeSpikeRule {
    fn name(&self) -> &'static str {
        "volume_spike"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let series = view.series(Timeframe::H1);
        if self.lookback == 0 || series.len() < self.lookback + 1 {
            return Ok(None);
        }
        let current = series[series.len() - 1].quote_volume;
        let window = &series[series.len() - 1 - self.lookback..series.len() - 1];
        let avg = window.iter().map(|c| c.quote_volume).sum::<f64>() / self.lookback as f64;
        if detect_volume_spike(current, avg, self.threshold) {
            let ratio = current / avg;
            return Ok(Some(SignalHit::new(
                "volume_spike",
                format!("{:.1}x average 1h volume", ratio),
            )));
        }
        Ok(None)
    }
}

/// Short-horizon move: percentage change between the last two 1h closes.
pub struct PriceMomentumRule {
    pub threshold_pct: f64,
}

impl SignalRule for PriceMomentumRule {
    fn name(&self) -> &'static str {
        "price_momentum"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let series = view.series(Timeframe::H1);
        if series.len() < 2 {
            return Ok(None);
        }
        let prev_close = series[series.len() - 2].close;
        let last_close = series[series.len() - 1].close;
        if prev_close <= 0.0 {
            return Ok(None);
        }
        let change_pct = (last_close - prev_close) / prev_close * 100.0;
        let hit = detect_price_momentum(change_pct, self.threshold_pct).map(|dir| match dir {
            | Direction::Bullish => {
                SignalHit::new("momentum_bullish", format!("{:+.1}% over 1h", change_pct))
            }
            | Direction::Bearish => {
                SignalHit::new("momentum_bearish", format!("{:+.1}% over 1h", change_pct))
            }
        });
        Ok(hit)
    }
}

/// Large 24h move in either direction.
pub struct VolatilityRule {
    pub threshold_pct: f64,
}

impl SignalRule for VolatilityRule {
    fn name(&self) -> &'static str {
        "volatility"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let Some(stats) = view.stats.as_ref() else {
            return Ok(None);
        };
        if detect_volatility(stats.price_change_pct_24h, self.threshold_pct) {
            return Ok(Some(SignalHit::new(
                "volatility",
                format!("{:+.1}% over 24h", stats.price_change_pct_24h),
            )));
        }
        Ok(None)
    }
}

/// Price within a configured fraction of the 24h high or low.
pub struct NearExtremeRule {
    pub threshold: f64,
}

impl SignalRule for NearExtremeRule {
    fn name(&self) -> &'static str {
        "near_extreme"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let (Some(stats), Some(price)) = (view.stats.as_ref(), view.last_price()) else {
            return Ok(None);
        };
        let hit = detect_near_extremes(price, stats.high_24h, stats.low_24h, self.threshold).map(
            |side| match side {
                | ExtremeSide::High => SignalHit::new(
                    "near_high",
                    format!("price {} within {:.1}% of 24h high {}", price, self.threshold * 100.0, stats.high_24h),
                ),
                | ExtremeSide::Low => SignalHit::new(
                    "near_low",
                    format!("price {} within {:.1}% of 24h low {}", price, self.threshold * 100.0, stats.low_24h),
                ),
            },
        );
        Ok(hit)
    }
}

/// Absolute funding rate beyond the configured threshold.
pub struct FundingAnomalyRule {
    pub threshold: f64,
}

impl SignalRule for FundingAnomalyRule {
    fn name(&self) -> &'static str {
        "funding_anomaly"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let Some(rate) = view.derivs.as_ref().and_then(|d| d.funding_rate) else {
            return Ok(None);
        };
        if detect_funding_anomaly(rate, self.threshold) {
            return Ok(Some(SignalHit::new(
                "funding_anomaly",
                format!("funding rate {:+.4}", rate),
            )));
        }
        Ok(None)
    }
}

/// Open interest jump vs the previous snapshot.
pub struct OiJumpRule {
    pub threshold: f64,
}

impl SignalRule for OiJumpRule {
    fn name(&self) -> &'static str {
        "oi_jump"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let (Some(current), Some(prev)) = (
            view.derivs.as_ref().and_then(|d| d.open_interest),
            view.prev_open_interest,
        ) else {
            return Ok(None);
        };
        if detect_oi_jump(current, prev, self.threshold) {
            return Ok(Some(SignalHit::new(
                "oi_jump",
                format!("open interest {:.1}x previous", current / prev),
            )));
        }
        Ok(None)
    }
}

/// N consecutive same-direction 1h closes.
pub struct StairStepRule {
    pub run: usize,
}

impl SignalRule for StairStepRule {
    fn name(&self) -> &'static str {
        "stair_step"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let series = view.series(Timeframe::H1);
        if self.run == 0 || series.len() < self.run {
            return Ok(None);
        }

        let mut up = 0usize;
        let mut down = 0usize;
        for candle in series.iter().rev() {
            if candle.is_bullish() && down == 0 {
                up += 1;
            } else if candle.is_bearish() && up == 0 {
                down += 1;
            } else {
                break;
            }
        }

        if up >= self.run {
            return Ok(Some(SignalHit::new("stair_step_up", format!("{} consecutive green 1h candles", up))));
        }
        if down >= self.run {
            return Ok(Some(SignalHit::new("stair_step_down", format!("{} consecutive red 1h candles", down))));
        }
        Ok(None)
    }
}

/// Close outside the rolling range of the preceding K candles by more than
/// the breakout margin.
pub struct RangeBreakRule {
    pub lookback: usize,
    pub margin: f64,
}

impl SignalRule for RangeBreakRule {
    fn name(&self) -> &'static str {
        "range_break"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let series = view.series(Timeframe::H1);
        if self.lookback == 0 || series.len() < self.lookback + 1 {
            return Ok(None);
        }
        // range over the candles preceding the current one
        let window = &series[series.len() - 1 - self.lookback..series.len() - 1];
        let range_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let range_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        if range_high <= 0.0 || range_low <= 0.0 {
            return Ok(None);
        }
        let close = series[series.len() - 1].close;
        let range_mid = (range_high + range_low) / 2.0;
        let range_size_pct = (range_high - range_low) / range_mid * 100.0;

        if close > range_high * (1.0 + self.margin) {
            return Ok(Some(SignalHit::new(
                "range_break_up",
                format!("close {} above {:.1}% range high {}", close, range_size_pct, range_high),
            )));
        }
        if close < range_low * (1.0 - self.margin) {
            return Ok(Some(SignalHit::new(
                "range_break_down",
                format!("close {} below {:.1}% range low {}", close, range_size_pct, range_low),
            )));
        }
        Ok(None)
    }
}

/// Tick-to-tick price spike from the streaming feed.
pub struct TickSpikeRule {
    pub threshold_pct: f64,
}

impl SignalRule for TickSpikeRule {
    fn name(&self) -> &'static str {
        "tick_spike"
    }

    fn evaluate(&self, view: &InstrumentView) -> Result<Option<SignalHit>> {
        let (Some(tick), Some(prev)) = (view.last_tick.as_ref(), view.prev_tick_price) else {
            return Ok(None);
        };
        if detect_tick_spike(tick.price, prev, self.threshold_pct) {
            let change_pct = (tick.price - prev) / prev * 100.0;
            return Ok(Some(SignalHit::new(
                "tick_spike",
                format!("{:+.2}% between ticks", change_pct),
            )));
        }
        Ok(None)
    }
}
