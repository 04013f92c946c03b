//! Technical indicators over candle series.
//!
//! Prices stay in `Decimal`; dimensionless statistics (widths, ratios,
//! correlations) are returned as `f64`. Every function returns `None`
//! when the series is too short rather than guessing.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::Candle;

/// Average True Range over the last `period` candles (simple mean of true ranges).
///
/// Needs `period + 1` candles so every true range has a previous close.
pub fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - period - 1..];
    let sum: Decimal = window
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .sum();
    Some(sum / Decimal::from(period))
}

fn true_range(candle: &Candle, prev_close: Decimal) -> Decimal {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Simple moving average of the last `period` values
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values[values.len() - period..].iter().copied().sum();
    Some(sum / Decimal::from(period))
}

/// Exponential moving average, seeded with the SMA of the first `period` values
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = Decimal::from(2) / Decimal::from(period + 1);
    let seed: Decimal = values[..period].iter().copied().sum::<Decimal>() / Decimal::from(period);
    Some(
        values[period..]
            .iter()
            .fold(seed, |prev, v| alpha * *v + (Decimal::ONE - alpha) * prev),
    )
}

pub fn closes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

/// Bollinger band width (upper - lower) / middle with `k` standard deviations
pub fn bollinger_width(candles: &[Candle], period: usize, k: f64) -> Option<f64> {
    if period < 2 || candles.len() < period {
        return None;
    }
    let window: Vec<f64> = candles[candles.len() - period..]
        .iter()
        .filter_map(|c| c.close.to_f64())
        .collect();
    if window.len() != period {
        return None;
    }
    let mean = window.iter().sum::<f64>() / period as f64;
    if mean <= 0.0 {
        return None;
    }
    let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
    Some(2.0 * k * variance.sqrt() / mean)
}

/// Last candle's volume relative to the mean of the `lookback` candles before it
pub fn volume_surge(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }
    let last = candles.last()?.volume;
    let base = &candles[candles.len() - lookback - 1..candles.len() - 1];
    let mean: Decimal = base.iter().map(|c| c.volume).sum::<Decimal>() / Decimal::from(lookback);
    if mean <= Decimal::ZERO {
        return None;
    }
    (last / mean).to_f64()
}

/// Log returns of consecutive closes
pub fn log_returns(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].close.to_f64()?;
            let next = pair[1].close.to_f64()?;
            if prev <= 0.0 || next <= 0.0 {
                return None;
            }
            Some((next / prev).ln())
        })
        .collect()
}

/// Pearson correlation over the aligned tails of two series
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// Highs strictly above the `strength` candles on each side
pub fn swing_highs(candles: &[Candle], strength: usize) -> Vec<Decimal> {
    swing_points(candles, strength, |c| c.high, |pivot, other| pivot > other)
}

/// Lows strictly below the `strength` candles on each side
pub fn swing_lows(candles: &[Candle], strength: usize) -> Vec<Decimal> {
    swing_points(candles, strength, |c| c.low, |pivot, other| pivot < other)
}

fn swing_points(
    candles: &[Candle],
    strength: usize,
    value: impl Fn(&Candle) -> Decimal,
    dominates: impl Fn(Decimal, Decimal) -> bool,
) -> Vec<Decimal> {
    if strength == 0 || candles.len() < 2 * strength + 1 {
        return Vec::new();
    }
    (strength..candles.len() - strength)
        .filter_map(|i| {
            let pivot = value(&candles[i]);
            let neighbors = candles[i - strength..i]
                .iter()
                .chain(&candles[i + 1..=i + strength]);
            neighbors
                .map(&value)
                .all(|other| dominates(pivot, other))
                .then_some(pivot)
        })
        .collect()
}

/// Highest high of the last `lookback` candles
pub fn highest_high(candles: &[Candle], lookback: usize) -> Option<Decimal> {
    let start = candles.len().saturating_sub(lookback);
    candles[start..].iter().map(|c| c.high).max()
}

/// Lowest low of the last `lookback` candles
pub fn lowest_low(candles: &[Candle], lookback: usize) -> Option<Decimal> {
    let start = candles.len().saturating_sub(lookback);
    candles[start..].iter().map(|c| c.low).min()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    /// Candles from (open, high, low, close, volume) tuples, 15 minutes apart
    pub fn candles(rows: &[(Decimal, Decimal, Decimal, Decimal, Decimal)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, (o, h, l, c, v))| Candle {
                open_time: start + Duration::minutes(15 * i as i64),
                open: *o,
                high: *h,
                low: *l,
                close: *c,
                volume: *v,
            })
            .collect()
    }

    /// Flat candles around `price` with a fixed range
    pub fn flat(n: usize, price: Decimal, half_range: Decimal, volume: Decimal) -> Vec<Candle> {
        let rows: Vec<_> = (0..n)
            .map(|_| (price, price + half_range, price - half_range, price, volume))
            .collect();
        candles(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_atr_flat_series() {
        let series = flat(15, dec!(100), dec!(1), dec!(10));
        assert_eq!(atr(&series, 14), Some(dec!(2)));
        assert_eq!(atr(&series[..14], 14), None);
    }

    #[test]
    fn test_atr_uses_gap_from_previous_close() {
        let series = candles(&[
            (dec!(100), dec!(101), dec!(99), dec!(100), dec!(1)),
            (dec!(105), dec!(106), dec!(104), dec!(105), dec!(1)),
        ]);
        // high - prev close = 6 beats the 2-point range
        assert_eq!(atr(&series, 1), Some(dec!(6)));
    }

    #[test]
    fn test_sma_and_ema() {
        let values = vec![dec!(1), dec!(2), dec!(3), dec!(4)];
        assert_eq!(sma(&values, 2), Some(dec!(3.5)));
        assert_eq!(ema(&values, 4), Some(dec!(2.5)));
        let e = ema(&values, 2).unwrap();
        assert!(e > dec!(3) && e < dec!(4));
    }

    #[test]
    fn test_volume_surge() {
        let mut series = flat(21, dec!(100), dec!(1), dec!(10));
        series.last_mut().unwrap().volume = dec!(30);
        let surge = volume_surge(&series, 20).unwrap();
        assert!((surge - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_bounds() {
        let a = vec![0.01, -0.02, 0.03, 0.01, -0.01];
        let b: Vec<f64> = a.iter().map(|x| x * 2.0).collect();
        let neg: Vec<f64> = a.iter().map(|x| -x).collect();
        assert!((correlation(&a, &b).unwrap() - 1.0).abs() < 1e-9);
        assert!((correlation(&a, &neg).unwrap() + 1.0).abs() < 1e-9);
        assert!(correlation(&a, &[0.0; 5]).is_none());
    }

    #[test]
    fn test_swing_points() {
        let series = candles(&[
            (dec!(100), dec!(101), dec!(99), dec!(100), dec!(1)),
            (dec!(100), dec!(105), dec!(99), dec!(104), dec!(1)),
            (dec!(104), dec!(103), dec!(97), dec!(98), dec!(1)),
            (dec!(98), dec!(102), dec!(96), dec!(101), dec!(1)),
            (dec!(101), dec!(102), dec!(98), dec!(100), dec!(1)),
        ]);
        assert_eq!(swing_highs(&series, 1), vec![dec!(105)]);
        assert_eq!(swing_lows(&series, 1), vec![dec!(96)]);
        assert_eq!(highest_high(&series, 3), Some(dec!(103)));
        assert_eq!(lowest_low(&series, 10), Some(dec!(96)));
    }

    #[test]
    fn test_bollinger_width_zero_for_flat_closes() {
        let series = flat(20, dec!(50), dec!(1), dec!(1));
        assert_eq!(bollinger_width(&series, 20, 2.0), Some(0.0));
    }
}
