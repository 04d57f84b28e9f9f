//! Basic signal detection primitives.
//!
//! Pure threshold checks over already-resident values; the rule catalog in
//! [`super::rules`] wires these to instrument views. All guards against
//! non-positive inputs return "not detected" rather than erroring.

/// Direction of a detected move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bullish,
    Bearish,
}

/// Side of a detected price extreme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremeSide {
    High,
    Low,
}

/// Current volume at or above `threshold` times the average volume.
/// A zero or negative average never detects (no divide-by-zero).
pub fn detect_volume_spike(current_volume: f64, avg_volume: f64, threshold: f64) -> bool {
    if avg_volume <= 0.0 || current_volume <= 0.0 {
        return false;
    }
    current_volume / avg_volume >= threshold
}

/// Open interest at or above `threshold` times its previous value.
pub fn detect_oi_jump(current_oi: f64, prev_oi: f64, threshold: f64) -> bool {
    if prev_oi <= 0.0 || current_oi <= 0.0 {
        return false;
    }
    current_oi / prev_oi >= threshold
}

/// Absolute funding rate at or above `threshold`.
pub fn detect_funding_anomaly(funding_rate: f64, threshold: f64) -> bool {
    funding_rate.abs() >= threshold
}

/// Short-horizon percentage change with magnitude at or above `threshold`,
/// tagged by sign.
pub fn detect_price_momentum(change_pct: f64, threshold: f64) -> Option<Direction> {
    if change_pct >= threshold {
        Some(Direction::Bullish)
    } else if change_pct <= -threshold {
        Some(Direction::Bearish)
    } else {
        None
    }
}

/// Longer-horizon percentage change with magnitude at or above `threshold`.
pub fn detect_volatility(change_pct_24h: f64, threshold: f64) -> bool {
    change_pct_24h.abs() >= threshold
}

/// Price within `threshold` (as a fraction of the extreme) of the period high
/// or low. A price beyond the recorded extreme also counts as near it.
pub fn detect_near_extremes(
    current_price: f64,
    high_price: f64,
    low_price: f64,
    threshold: f64,
) -> Option<ExtremeSide> {
    if high_price <= 0.0 || low_price <= 0.0 || current_price <= 0.0 {
        return None;
    }
    let high_distance = (high_price - current_price) / high_price;
    let low_distance = (current_price - low_price) / low_price;
    if high_distance <= threshold {
        Some(ExtremeSide::High)
    } else if low_distance <= threshold {
        Some(ExtremeSide::Low)
    } else {
        None
    }
}

/// Tick-to-tick price change above `threshold_pct` percent.
pub fn detect_tick_spike(current_price: f64, last_price: f64, threshold_pct: f64) -> bool {
    if last_price <= 0.0 || current_price <= 0.0 {
        return false;
    }
    let change_pct = ((current_price - last_price) / last_price).abs() * 100.0;
    change_pct > threshold_pct
}
