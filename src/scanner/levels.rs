//! Support/resistance detection from swing points.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::ScannerConfig;
use crate::domain::{Candle, Level, LevelKind};
use crate::indicators;

/// Detect levels near `last_price` from the last `level_lookback` candles.
///
/// Swing highs become resistance and swing lows support regardless of where
/// price sits now, so a freshly broken resistance is still reported as one.
/// The newest candle never forms a pivot (it has no right-hand neighbors).
pub fn detect_levels(candles: &[Candle], last_price: Decimal, config: &ScannerConfig) -> Vec<Level> {
    if last_price <= Decimal::ZERO {
        return Vec::new();
    }
    let start = candles.len().saturating_sub(config.level_lookback);
    let window = &candles[start..];

    let mut levels = Vec::new();
    for (kind, points) in [
        (
            LevelKind::Resistance,
            indicators::swing_highs(window, config.swing_strength),
        ),
        (
            LevelKind::Support,
            indicators::swing_lows(window, config.swing_strength),
        ),
    ] {
        for (price, touches) in cluster(points, config.level_cluster_tolerance_pct) {
            let distance_pct = ((price - last_price).abs() / last_price)
                .to_f64()
                .unwrap_or(f64::MAX);
            if distance_pct <= config.max_level_distance_pct {
                levels.push(Level {
                    price,
                    kind,
                    touches,
                    distance_pct,
                });
            }
        }
    }

    levels.sort_by(|a, b| {
        a.distance_pct
            .total_cmp(&b.distance_pct)
            .then(b.touches.cmp(&a.touches))
    });
    levels.truncate(config.max_levels);
    levels
}

/// Merge prices within `tolerance_pct` of a cluster's first member.
/// Returns (mean price, member count) per cluster.
fn cluster(mut points: Vec<Decimal>, tolerance_pct: f64) -> Vec<(Decimal, u32)> {
    points.sort();
    let tolerance = Decimal::try_from(tolerance_pct).unwrap_or(Decimal::ZERO);

    let mut clusters: Vec<Vec<Decimal>> = Vec::new();
    for price in points {
        match clusters.last_mut() {
            Some(current)
                if current
                    .first()
                    .is_some_and(|anchor| price - *anchor <= *anchor * tolerance) =>
            {
                current.push(price)
            }
            _ => clusters.push(vec![price]),
        }
    }

    clusters
        .into_iter()
        .map(|members| {
            let count = members.len();
            let mean = members.iter().copied().sum::<Decimal>() / Decimal::from(count);
            (mean, count as u32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::candles;
    use rust_decimal_macros::dec;

    fn config() -> ScannerConfig {
        ScannerConfig {
            swing_strength: 1,
            level_cluster_tolerance_pct: 0.003,
            max_level_distance_pct: 0.05,
            max_levels: 4,
            ..ScannerConfig::default()
        }
    }

    #[test]
    fn test_cluster_merges_nearby_points() {
        let clusters = cluster(vec![dec!(100.2), dec!(100), dec!(105)], 0.003);
        assert_eq!(clusters, vec![(dec!(100.1), 2), (dec!(105), 1)]);
    }

    #[test]
    fn test_detects_resistance_and_support() {
        let series = candles(&[
            (dec!(100), dec!(101), dec!(99), dec!(100), dec!(1)),
            (dec!(100), dec!(104), dec!(99.5), dec!(103), dec!(1)),
            (dec!(103), dec!(103), dec!(98), dec!(99), dec!(1)),
            (dec!(99), dec!(101), dec!(97), dec!(100), dec!(1)),
            (dec!(100), dec!(104.1), dec!(99), dec!(103), dec!(1)),
            (dec!(103), dec!(103.5), dec!(100), dec!(101), dec!(1)),
        ]);
        let levels = detect_levels(&series, dec!(101), &config());

        let resistance = levels
            .iter()
            .find(|l| l.kind == LevelKind::Resistance)
            .unwrap();
        assert_eq!(resistance.touches, 2);
        assert_eq!(resistance.price, dec!(104.05));

        let support = levels.iter().find(|l| l.kind == LevelKind::Support).unwrap();
        assert_eq!(support.price, dec!(97));
    }

    #[test]
    fn test_far_levels_dropped() {
        let series = candles(&[
            (dec!(100), dec!(101), dec!(99), dec!(100), dec!(1)),
            (dec!(100), dec!(150), dec!(99), dec!(100), dec!(1)),
            (dec!(100), dec!(101), dec!(99), dec!(100), dec!(1)),
        ]);
        let levels = detect_levels(&series, dec!(100), &config());
        assert!(levels.iter().all(|l| l.kind != LevelKind::Resistance));
    }
}
