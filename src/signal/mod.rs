//! Entry signal generation.
//!
//! Strategies implement [`EntryStrategy`] and are held in a priority-ordered
//! registry. Every strategy sees every candidate (so stateful ones such as
//! retest can record breakouts) and the best signal per symbol wins.

mod momentum;
mod retest;

pub use momentum::MomentumStrategy;
pub use retest::RetestStrategy;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::SignalConfig;
use crate::domain::{
    Candle, Level, LevelKind, MarketData, MarketSnapshot, ScanResult, Signal, StrategyKind,
};

/// Pluggable entry strategy
pub trait EntryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Evaluate one candidate against its latest snapshot
    fn evaluate(
        &mut self,
        candidate: &ScanResult,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Option<Signal>;

    /// Drop expired internal state
    fn prune(&mut self, _now: DateTime<Utc>) {}

    /// Symbols with state carried into later cycles
    fn watched_symbols(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Level closed through by the last candle in its breakout direction,
/// nearest first.
pub(crate) fn broken_level<'a>(candidate: &'a ScanResult, candles: &[Candle]) -> Option<&'a Level> {
    let [.., prev, last] = candles else {
        return None;
    };
    candidate
        .levels
        .iter()
        .filter(|level| match level.kind {
            LevelKind::Resistance => prev.close <= level.price && last.close > level.price,
            LevelKind::Support => prev.close >= level.price && last.close < level.price,
        })
        .min_by_key(|level| (last.close - level.price).abs())
}

pub struct SignalGenerator {
    strategies: Vec<Box<dyn EntryStrategy>>,
    /// Open time of the candle each symbol last signalled on
    last_signal_candle: HashMap<String, DateTime<Utc>>,
}

impl SignalGenerator {
    /// Build the registry from config, in configured priority order
    pub fn new(config: &SignalConfig) -> Self {
        let strategies = config
            .priority
            .iter()
            .filter_map(|kind| -> Option<Box<dyn EntryStrategy>> {
                match kind {
                    StrategyKind::Momentum if config.momentum.enabled => {
                        Some(Box::new(MomentumStrategy::new(config)))
                    }
                    StrategyKind::Retest if config.retest.enabled => {
                        Some(Box::new(RetestStrategy::new(config)))
                    }
                    _ => None,
                }
            })
            .collect();
        Self::with_strategies(strategies)
    }

    /// Custom registry; earlier entries win ties
    pub fn with_strategies(strategies: Vec<Box<dyn EntryStrategy>>) -> Self {
        Self {
            strategies,
            last_signal_candle: HashMap::new(),
        }
    }

    pub fn strategy_kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Symbols any strategy is still waiting on, e.g. an unretested breakout
    pub fn watched_symbols(&self) -> HashSet<String> {
        self.strategies
            .iter()
            .flat_map(|s| s.watched_symbols())
            .collect()
    }

    /// At most one signal per candidate
    pub fn generate(
        &mut self,
        candidates: &[ScanResult],
        market: &MarketData,
        now: DateTime<Utc>,
    ) -> Vec<Signal> {
        for strategy in &mut self.strategies {
            strategy.prune(now);
        }

        let mut signals = Vec::new();
        for candidate in candidates.iter().filter(|c| c.passed) {
            let Some(snapshot) = market.get(&candidate.symbol) else {
                continue;
            };
            if let Some(signal) = self.evaluate_candidate(candidate, snapshot, now) {
                signals.push(signal);
            }
        }
        signals.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        signals
    }

    /// Run every strategy on one candidate and keep the best signal
    pub fn evaluate_candidate(
        &mut self,
        candidate: &ScanResult,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let candle_time = snapshot.candles.last()?.open_time;

        // Strategies are iterated in priority order, so a strict `>` keeps
        // the higher-priority one on equal confidence
        let mut best: Option<Signal> = None;
        for strategy in &mut self.strategies {
            let Some(signal) = strategy.evaluate(candidate, snapshot, now) else {
                continue;
            };
            if let Err(e) = signal.validate() {
                warn!(
                    symbol = %candidate.symbol,
                    strategy = %signal.strategy,
                    error = %e,
                    "dropping invalid signal"
                );
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |b| signal.confidence > b.confidence)
            {
                best = Some(signal);
            }
        }

        let signal = best?;
        if self.last_signal_candle.get(&candidate.symbol) == Some(&candle_time) {
            debug!(symbol = %candidate.symbol, "already signalled on this candle");
            return None;
        }
        self.last_signal_candle
            .insert(candidate.symbol.clone(), candle_time);
        debug!(
            symbol = %signal.symbol,
            strategy = %signal.strategy,
            side = %signal.side,
            confidence = signal.confidence,
            "signal emitted"
        );
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ScanMetrics, Side};
    use rust_decimal_macros::dec;

    struct Fixed {
        kind: StrategyKind,
        confidence: f64,
    }

    impl EntryStrategy for Fixed {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        fn evaluate(
            &mut self,
            candidate: &ScanResult,
            _snapshot: &MarketSnapshot,
            now: DateTime<Utc>,
        ) -> Option<Signal> {
            Some(Signal {
                symbol: candidate.symbol.clone(),
                side: Side::Long,
                strategy: self.kind,
                entry_price: dec!(100),
                stop_price: dec!(98),
                confidence: self.confidence,
                levels: vec![],
                atr: dec!(1),
                created_at: now,
            })
        }
    }

    fn fixture() -> (ScanResult, MarketSnapshot) {
        use crate::scanner::test_support::{breakout_candles, deep_book, snapshot};
        let snap = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let result = ScanResult {
            symbol: "SOLUSDT".into(),
            score: 0.8,
            passed: true,
            filters: vec![],
            levels: vec![],
            metrics: ScanMetrics::default(),
            scanned_at: Utc::now(),
        };
        (result, snap)
    }

    fn generator(a: f64, b: f64) -> SignalGenerator {
        SignalGenerator::with_strategies(vec![
            Box::new(Fixed {
                kind: StrategyKind::Retest,
                confidence: a,
            }),
            Box::new(Fixed {
                kind: StrategyKind::Momentum,
                confidence: b,
            }),
        ])
    }

    #[test]
    fn test_highest_confidence_wins() {
        let (cand, snap) = fixture();
        let signal = generator(0.6, 0.8)
            .evaluate_candidate(&cand, &snap, Utc::now())
            .unwrap();
        assert_eq!(signal.strategy, StrategyKind::Momentum);
    }

    #[test]
    fn test_tie_goes_to_priority() {
        let (cand, snap) = fixture();
        let signal = generator(0.7, 0.7)
            .evaluate_candidate(&cand, &snap, Utc::now())
            .unwrap();
        assert_eq!(signal.strategy, StrategyKind::Retest);
    }

    #[test]
    fn test_invalid_confidence_dropped() {
        let (cand, snap) = fixture();
        let signal = generator(1.5, 0.7)
            .evaluate_candidate(&cand, &snap, Utc::now())
            .unwrap();
        assert_eq!(signal.strategy, StrategyKind::Momentum);
    }

    #[test]
    fn test_one_signal_per_candle() {
        let (cand, snap) = fixture();
        let mut gen = generator(0.7, 0.7);
        assert!(gen.evaluate_candidate(&cand, &snap, Utc::now()).is_some());
        assert!(gen.evaluate_candidate(&cand, &snap, Utc::now()).is_none());
    }

    #[test]
    fn test_registry_follows_config_priority() {
        let mut cfg = SignalConfig::default();
        cfg.priority = vec![StrategyKind::Momentum, StrategyKind::Retest];
        cfg.retest.enabled = false;
        let gen = SignalGenerator::new(&cfg);
        assert_eq!(gen.strategy_kinds(), vec![StrategyKind::Momentum]);
    }

    #[test]
    fn test_generate_emits_momentum_on_breakout() {
        use crate::scanner::test_support::{breakout_candles, deep_book, loose_config, snapshot};
        use crate::scanner::MarketScanner;

        let snap = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(700), dec!(300)),
        );
        let market = MarketData::new(vec![snap], None, Utc::now());
        let results = MarketScanner::new(loose_config()).scan(&market, Utc::now());

        let mut gen = SignalGenerator::new(&SignalConfig::default());
        let signals = gen.generate(&results, &market, Utc::now());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].strategy, StrategyKind::Momentum);
        assert!((0.0..=1.0).contains(&signals[0].confidence));
    }
}
