use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

use super::{broken_level, EntryStrategy};
use crate::config::{RetestConfig, SignalConfig};
use crate::domain::{Level, MarketSnapshot, ScanResult, Side, Signal, StrategyKind};
use crate::indicators;

/// A level recently broken, waiting for price to come back to it
#[derive(Debug, Clone)]
struct Breakout {
    level: Level,
    side: Side,
    /// Open time of the breakout candle
    candle_time: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
}

/// Enters on the first pullback to a freshly broken level that holds.
///
/// Keeps a short TTL-bounded history of breakouts per symbol.
pub struct RetestStrategy {
    config: RetestConfig,
    atr_period: usize,
    volume_lookback: usize,
    breakouts: HashMap<String, Vec<Breakout>>,
}

impl RetestStrategy {
    pub fn new(signals: &SignalConfig) -> Self {
        Self {
            config: signals.retest.clone(),
            atr_period: signals.atr_period,
            volume_lookback: signals.volume_lookback,
            breakouts: HashMap::new(),
        }
    }

    /// Number of breakouts currently remembered for `symbol`
    pub fn pending(&self, symbol: &str) -> usize {
        self.breakouts.get(symbol).map_or(0, Vec::len)
    }

    fn record(&mut self, candidate: &ScanResult, snapshot: &MarketSnapshot, now: DateTime<Utc>) {
        let candles = &snapshot.candles;
        let (Some(last), Some(level)) = (candles.last(), broken_level(candidate, candles)) else {
            return;
        };
        let surge = indicators::volume_surge(candles, self.volume_lookback).unwrap_or(0.0);
        if surge < self.config.min_breakout_surge {
            return;
        }

        let side = level.kind.breakout_side();
        let history = self.breakouts.entry(candidate.symbol.clone()).or_default();
        let known = history
            .iter()
            .any(|b| b.side == side && b.level.price == level.price);
        if !known {
            debug!(symbol = %candidate.symbol, level = %level.price, %side, "breakout recorded");
            history.push(Breakout {
                level: level.clone(),
                side,
                candle_time: last.open_time,
                recorded_at: now,
            });
        }
    }
}

impl EntryStrategy for RetestStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Retest
    }

    fn evaluate(
        &mut self,
        candidate: &ScanResult,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        self.prune(now);

        let candles = &snapshot.candles;
        let last = candles.last()?;
        let tolerance = self.config.tolerance_pct;

        // Only candles after the breakout candle can retest it
        let history = self.breakouts.get(&candidate.symbol);
        let hit = history.and_then(|h| {
            h.iter().position(|b| {
                if last.open_time <= b.candle_time {
                    return false;
                }
                let price = b.level.price;
                let upper = price * (Decimal::ONE + tolerance);
                let lower = price * (Decimal::ONE - tolerance);
                match b.side {
                    Side::Long => last.low <= upper && last.low >= lower && last.close > price,
                    Side::Short => last.high >= lower && last.high <= upper && last.close < price,
                }
            })
        });

        let Some(index) = hit else {
            self.record(candidate, snapshot, now);
            return None;
        };

        let atr = indicators::atr(candles, self.atr_period)?;
        let breakout = self.breakouts.get_mut(&candidate.symbol)?.remove(index);
        let level_price = breakout.level.price;
        let offset = atr * self.config.atr_stop_buffer;
        let (stop_price, touch) = match breakout.side {
            Side::Long => (level_price - offset, last.low),
            Side::Short => (level_price + offset, last.high),
        };

        // Closer touch and a firmer close read as a cleaner retest
        let band = level_price * tolerance;
        let proximity = if band > Decimal::ZERO {
            (Decimal::ONE - (touch - level_price).abs() / band)
                .to_f64()
                .unwrap_or(0.0)
                .clamp(0.0, 1.0)
        } else {
            1.0
        };
        let quality = 0.5 * (proximity + last.body_ratio());
        let base = self.config.base_confidence;
        let confidence = (base + (1.0 - base) * quality).clamp(0.0, 1.0);

        debug!(symbol = %candidate.symbol, level = %level_price, confidence, "retest confirmed");

        Some(Signal {
            symbol: candidate.symbol.clone(),
            side: breakout.side,
            strategy: StrategyKind::Retest,
            entry_price: last.close,
            stop_price,
            confidence,
            levels: vec![breakout.level],
            atr,
            created_at: now,
        })
    }

    fn watched_symbols(&self) -> Vec<String> {
        self.breakouts
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::seconds(self.config.breakout_ttl_secs);
        self.breakouts.retain(|_, history| {
            history.retain(|b| now - b.recorded_at <= ttl);
            !history.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Candle, MarketData};
    use crate::scanner::test_support::{breakout_candles, deep_book, loose_config, snapshot};
    use crate::scanner::MarketScanner;
    use rust_decimal_macros::dec;

    fn candidate(snap: &MarketSnapshot) -> ScanResult {
        let market = MarketData::new(vec![snap.clone()], None, Utc::now());
        MarketScanner::new(loose_config())
            .scan(&market, Utc::now())
            .remove(0)
    }

    fn with_candle(mut candles: Vec<Candle>, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Vec<Candle> {
        let last_time = candles.last().unwrap().open_time;
        candles.push(Candle {
            open_time: last_time + Duration::minutes(15),
            open,
            high,
            low,
            close,
            volume: dec!(150),
        });
        candles
    }

    #[test]
    fn test_retest_fires_after_breakout() {
        let mut strategy = RetestStrategy::new(&SignalConfig::default());
        let now = Utc::now();

        let breakout = breakout_candles(dec!(102.5), dec!(300));
        let snap = snapshot("SOLUSDT", breakout.clone(), deep_book(dec!(102.5), dec!(500), dec!(300)));
        assert!(strategy.evaluate(&candidate(&snap), &snap, now).is_none());
        assert_eq!(strategy.pending("SOLUSDT"), 1);

        // Pullback wicks to 102.1, within 0.2% of the 102 level, and closes above it
        let retest = with_candle(breakout, dec!(102.5), dec!(102.8), dec!(102.1), dec!(102.7));
        let snap = snapshot("SOLUSDT", retest, deep_book(dec!(102.7), dec!(500), dec!(300)));
        let signal = strategy
            .evaluate(&candidate(&snap), &snap, now + Duration::minutes(15))
            .unwrap();

        assert_eq!(signal.strategy, StrategyKind::Retest);
        assert_eq!(signal.side, Side::Long);
        assert_eq!(signal.entry_price, dec!(102.7));
        assert!(signal.stop_price < dec!(102));
        assert!(signal.validate().is_ok());
        assert_eq!(strategy.pending("SOLUSDT"), 0);
    }

    #[test]
    fn test_retest_stop_tighter_than_momentum() {
        let cfg = SignalConfig::default();
        assert!(cfg.retest.atr_stop_buffer < cfg.momentum.atr_stop_buffer);
    }

    #[test]
    fn test_failed_retest_does_not_fire() {
        let mut strategy = RetestStrategy::new(&SignalConfig::default());
        let now = Utc::now();
        let breakout = breakout_candles(dec!(102.5), dec!(300));
        let snap = snapshot("SOLUSDT", breakout.clone(), deep_book(dec!(102.5), dec!(500), dec!(300)));
        strategy.evaluate(&candidate(&snap), &snap, now);

        // Closes back below the level
        let failed = with_candle(breakout, dec!(102.3), dec!(102.4), dec!(101.9), dec!(101.95));
        let snap = snapshot("SOLUSDT", failed, deep_book(dec!(101.95), dec!(500), dec!(300)));
        assert!(strategy
            .evaluate(&candidate(&snap), &snap, now + Duration::minutes(15))
            .is_none());
    }

    #[test]
    fn test_breakouts_expire() {
        let mut strategy = RetestStrategy::new(&SignalConfig::default());
        let now = Utc::now();
        let snap = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        strategy.evaluate(&candidate(&snap), &snap, now);
        assert_eq!(strategy.pending("SOLUSDT"), 1);
        assert_eq!(strategy.watched_symbols(), vec!["SOLUSDT".to_string()]);

        strategy.prune(now + Duration::hours(5));
        assert_eq!(strategy.pending("SOLUSDT"), 0);
        assert!(strategy.watched_symbols().is_empty());
    }
}
