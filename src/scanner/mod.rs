//! Market scanner: raw snapshots → ranked, filtered candidates.
//!
//! Stages run in order and short-circuit per symbol:
//! universe → liquidity → volatility → correlation → levels → scoring.
//! Rejected symbols are kept with `passed = false` so the query surface can
//! show why they were dropped.

mod levels;

pub use levels::detect_levels;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

use crate::config::ScannerConfig;
use crate::domain::{
    Candle, FilterOutcome, FilterStage, MarketData, MarketSnapshot, ScanMetrics, ScanResult,
};
use crate::indicators;

pub struct MarketScanner {
    config: ScannerConfig,
}

impl MarketScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Symbols the engine should request each cycle (universe plus reference)
    pub fn requested_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .config
            .universe
            .iter()
            .filter(|s| self.is_allowed(s))
            .cloned()
            .collect();
        if let Some(reference) = &self.config.reference_symbol {
            if !symbols.contains(reference) {
                symbols.push(reference.clone());
            }
        }
        symbols
    }

    /// Full pipeline in one call
    pub fn scan(&self, market: &MarketData, now: DateTime<Utc>) -> Vec<ScanResult> {
        let screened = self.screen(market, now);
        self.build_levels(screened, market)
    }

    /// Stages 1-4: universe, liquidity, volatility and correlation filters
    pub fn screen(&self, market: &MarketData, now: DateTime<Utc>) -> Vec<ScanResult> {
        self.screen_watching(market, now, &HashSet::new())
    }

    /// Like [`MarketScanner::screen`], but `watched` symbols (pending
    /// retests) are exempt from the volume-surge floor
    pub fn screen_watching(
        &self,
        market: &MarketData,
        now: DateTime<Utc>,
        watched: &HashSet<String>,
    ) -> Vec<ScanResult> {
        let reference_returns = market
            .reference()
            .map(|r| self.tail_returns(&r.candles));

        let mut results: Vec<ScanResult> = market
            .snapshots()
            .filter(|s| Some(s.symbol.as_str()) != self.config.reference_symbol.as_deref())
            .map(|snapshot| {
                let watching = watched.contains(&snapshot.symbol);
                self.screen_one(snapshot, reference_returns.as_deref(), watching, now)
            })
            .collect();
        results.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        results
    }

    /// Stages 5-6: level detection and scoring, then ordering
    pub fn build_levels(&self, mut results: Vec<ScanResult>, market: &MarketData) -> Vec<ScanResult> {
        for result in results.iter_mut().filter(|r| r.passed) {
            let Some(snapshot) = market.get(&result.symbol) else {
                result.passed = false;
                result
                    .filters
                    .push(FilterOutcome::fail(FilterStage::Levels, "snapshot missing"));
                continue;
            };

            let levels = detect_levels(&snapshot.candles, result.metrics.last_price, &self.config);
            if levels.is_empty() {
                result.passed = false;
                result.filters.push(FilterOutcome::fail(
                    FilterStage::Levels,
                    format!(
                        "no level within {:.2}%",
                        self.config.max_level_distance_pct * 100.0
                    ),
                ));
                continue;
            }

            result.metrics.nearest_level_distance_pct =
                levels.iter().map(|l| l.distance_pct).reduce(f64::min);
            result.levels = levels;
            result.filters.push(FilterOutcome::pass(FilterStage::Levels));
            result.score = self.score(&result.metrics);
        }

        results.sort_by(compare_results);
        results
    }

    /// Top passing results, in rank order
    pub fn candidates<'a>(&self, results: &'a [ScanResult]) -> Vec<&'a ScanResult> {
        results
            .iter()
            .filter(|r| r.passed)
            .take(self.config.max_candidates)
            .collect()
    }

    fn is_allowed(&self, symbol: &str) -> bool {
        let allowed =
            self.config.allow_list.is_empty() || self.config.allow_list.iter().any(|s| s == symbol);
        allowed && !self.config.deny_list.iter().any(|s| s == symbol)
    }

    fn tail_returns(&self, candles: &[Candle]) -> Vec<f64> {
        let start = candles
            .len()
            .saturating_sub(self.config.correlation_lookback + 1);
        indicators::log_returns(&candles[start..])
    }

    fn screen_one(
        &self,
        snapshot: &MarketSnapshot,
        reference_returns: Option<&[f64]>,
        watching: bool,
        now: DateTime<Utc>,
    ) -> ScanResult {
        let cfg = &self.config;
        let mut result = ScanResult {
            symbol: snapshot.symbol.clone(),
            score: 0.0,
            passed: false,
            filters: Vec::with_capacity(5),
            levels: Vec::new(),
            metrics: ScanMetrics {
                last_price: snapshot.last_price(),
                quote_volume_24h: snapshot.ticker.quote_volume_24h,
                ..ScanMetrics::default()
            },
            scanned_at: now,
        };

        // 1. Universe and volume pre-filter
        if !self.is_allowed(&snapshot.symbol) {
            return reject(result, FilterStage::Universe, "not in allow list or denied");
        }
        if snapshot.ticker.quote_volume_24h < cfg.min_quote_volume_usd {
            let detail = format!(
                "24h volume {} < {}",
                snapshot.ticker.quote_volume_24h.round(), cfg.min_quote_volume_usd
            );
            return reject(result, FilterStage::Universe, detail);
        }
        if result.metrics.last_price <= Decimal::ZERO {
            return reject(result, FilterStage::Universe, "no price");
        }
        result.filters.push(FilterOutcome::pass(FilterStage::Universe));

        // 2. Liquidity
        let book = &snapshot.order_book;
        let Some(spread_bps) = book.spread_bps() else {
            return reject(result, FilterStage::Liquidity, "empty order book");
        };
        result.metrics.spread_bps = spread_bps;
        result.metrics.depth_usd = book.depth_usd(cfg.depth_band_pct);
        if spread_bps > cfg.max_spread_bps {
            let detail = format!("spread {:.1}bps > {:.1}bps", spread_bps, cfg.max_spread_bps);
            return reject(result, FilterStage::Liquidity, detail);
        }
        if result.metrics.depth_usd < cfg.min_depth_usd {
            let detail = format!(
                "depth {} < {}",
                result.metrics.depth_usd.round(), cfg.min_depth_usd
            );
            return reject(result, FilterStage::Liquidity, detail);
        }
        result.filters.push(FilterOutcome::pass(FilterStage::Liquidity));

        // 3. Volatility
        let candles = &snapshot.candles;
        let (Some(atr), Some(bb_width), Some(surge)) = (
            indicators::atr(candles, cfg.atr_period),
            indicators::bollinger_width(candles, cfg.bollinger_period, cfg.bollinger_k),
            indicators::volume_surge(candles, cfg.volume_lookback),
        ) else {
            let detail = format!("insufficient candles ({})", candles.len());
            return reject(result, FilterStage::Volatility, detail);
        };
        let atr_pct = (atr / result.metrics.last_price).to_f64().unwrap_or(0.0);
        result.metrics.atr = atr;
        result.metrics.atr_pct = atr_pct;
        result.metrics.bollinger_width = bb_width;
        result.metrics.volume_surge = surge;
        if atr_pct < cfg.min_atr_pct || atr_pct > cfg.max_atr_pct {
            let detail = format!(
                "atr {:.4} outside [{}, {}]",
                atr_pct, cfg.min_atr_pct, cfg.max_atr_pct
            );
            return reject(result, FilterStage::Volatility, detail);
        }
        if bb_width < cfg.min_bb_width || bb_width > cfg.max_bb_width {
            let detail = format!(
                "bollinger width {:.4} outside [{}, {}]",
                bb_width, cfg.min_bb_width, cfg.max_bb_width
            );
            return reject(result, FilterStage::Volatility, detail);
        }
        if surge < cfg.min_volume_surge && !watching {
            let detail = format!("volume surge {:.2} < {:.2}", surge, cfg.min_volume_surge);
            return reject(result, FilterStage::Volatility, detail);
        }
        result.filters.push(FilterOutcome::pass(FilterStage::Volatility));

        // 4. Correlation to the reference asset
        if let Some(reference) = reference_returns {
            let returns = self.tail_returns(candles);
            result.metrics.correlation = indicators::correlation(&returns, reference);
        }
        if let Some(corr) = result.metrics.correlation {
            if corr.abs() > cfg.max_correlation {
                let detail = format!("|corr| {:.2} > {:.2}", corr.abs(), cfg.max_correlation);
                return reject(result, FilterStage::Correlation, detail);
            }
        }
        result.filters.push(FilterOutcome::pass(FilterStage::Correlation));

        result.passed = true;
        result
    }

    /// Weighted sum of metrics normalized to [0, 1]
    fn score(&self, m: &ScanMetrics) -> f64 {
        let cfg = &self.config;
        let w = &cfg.weights;

        let liquidity = match (m.depth_usd.to_f64(), cfg.min_depth_usd.to_f64()) {
            (Some(depth), Some(min)) if min > 0.0 && depth > 0.0 => {
                ((depth / min).ln() / 10f64.ln()).clamp(0.0, 1.0)
            }
            _ => 1.0,
        };

        // Peaks in the middle of the accepted ATR band
        let half = (cfg.max_atr_pct - cfg.min_atr_pct) / 2.0;
        let volatility = if half > 0.0 {
            let mid = cfg.min_atr_pct + half;
            (1.0 - (m.atr_pct - mid).abs() / half).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let volume = if cfg.min_volume_surge > 0.0 {
            (m.volume_surge / (2.0 * cfg.min_volume_surge)).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let correlation = m.correlation.map_or(0.5, |c| 1.0 - c.abs());

        let proximity = m.nearest_level_distance_pct.map_or(0.0, |d| {
            (1.0 - d / cfg.max_level_distance_pct).clamp(0.0, 1.0)
        });

        w.liquidity * liquidity
            + w.volatility * volatility
            + w.volume * volume
            + w.correlation * correlation
            + w.level_proximity * proximity
    }
}

fn reject(mut result: ScanResult, stage: FilterStage, detail: impl Into<String>) -> ScanResult {
    let detail = detail.into();
    debug!(symbol = %result.symbol, stage = %stage, %detail, "scan rejected");
    result.filters.push(FilterOutcome::fail(stage, detail));
    result.passed = false;
    result
}

/// Passing first, then score desc, then depth desc; failures by symbol
fn compare_results(a: &ScanResult, b: &ScanResult) -> Ordering {
    b.passed
        .cmp(&a.passed)
        .then_with(|| {
            if a.passed {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| b.metrics.depth_usd.cmp(&a.metrics.depth_usd))
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.symbol.cmp(&b.symbol))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::{BookLevel, OrderBook, Ticker};
    use crate::indicators::test_support::candles;
    use rust_decimal_macros::dec;

    /// 60 candles ranging 99-101 with a swing high at 102, then a breakout
    /// candle closing at `last_close` on `last_volume`.
    pub fn breakout_candles(last_close: Decimal, last_volume: Decimal) -> Vec<Candle> {
        let mut rows = Vec::new();
        for i in 0..60 {
            let wobble = if i % 2 == 0 { dec!(0.3) } else { dec!(-0.3) };
            let close = dec!(100) + wobble;
            let high = if i == 50 { dec!(102) } else { dec!(101) };
            rows.push((dec!(100), high, dec!(99), close, dec!(100)));
        }
        let last_high = last_close.max(dec!(101.2)) + dec!(0.1);
        rows.push((dec!(101.2), last_high, dec!(101), last_close, last_volume));
        candles(&rows)
    }

    pub fn deep_book(mid: Decimal, bid_qty: Decimal, ask_qty: Decimal) -> OrderBook {
        let half_tick = mid * dec!(0.0002);
        OrderBook {
            bids: vec![
                BookLevel::new(mid - half_tick, bid_qty),
                BookLevel::new(mid * dec!(0.995), bid_qty),
            ],
            asks: vec![
                BookLevel::new(mid + half_tick, ask_qty),
                BookLevel::new(mid * dec!(1.005), ask_qty),
            ],
            timestamp: None,
        }
    }

    pub fn snapshot(symbol: &str, candles: Vec<Candle>, book: OrderBook) -> MarketSnapshot {
        let last = candles.last().map(|c| c.close).unwrap_or_default();
        MarketSnapshot {
            symbol: symbol.to_string(),
            timestamp: candles.last().map(|c| c.open_time).unwrap_or_else(Utc::now),
            candles,
            order_book: book,
            ticker: Ticker {
                symbol: symbol.to_string(),
                last_price: last,
                quote_volume_24h: dec!(100000000),
                price_change_pct_24h: 1.5,
            },
        }
    }

    /// Scanner thresholds loose enough for the synthetic fixtures
    pub fn loose_config() -> ScannerConfig {
        ScannerConfig {
            universe: vec!["SOLUSDT".into(), "AVAXUSDT".into()],
            reference_symbol: None,
            min_depth_usd: dec!(10000),
            min_atr_pct: 0.001,
            max_atr_pct: 0.1,
            min_bb_width: 0.0,
            max_bb_width: 0.5,
            min_volume_surge: 1.0,
            max_level_distance_pct: 0.05,
            ..ScannerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::domain::LevelKind;
    use rust_decimal_macros::dec;

    fn market(snapshots: Vec<MarketSnapshot>) -> MarketData {
        MarketData::new(snapshots, None, Utc::now())
    }

    #[test]
    fn test_scan_passes_breakout_candidate_with_levels() {
        let scanner = MarketScanner::new(loose_config());
        let sol = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let results = scanner.scan(&market(vec![sol]), Utc::now());

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.passed, "{:?}", result.filters);
        assert!(result.score > 0.0 && result.score <= 1.0);
        assert!(result
            .levels
            .iter()
            .any(|l| l.kind == LevelKind::Resistance && l.price == dec!(102)));
        assert_eq!(result.filters.len(), 5);
    }

    #[test]
    fn test_wide_spread_fails_liquidity_and_is_kept() {
        let scanner = MarketScanner::new(loose_config());
        let mut book = deep_book(dec!(102.5), dec!(500), dec!(300));
        book.asks[0].price = dec!(104);
        let sol = snapshot("SOLUSDT", breakout_candles(dec!(102.5), dec!(300)), book);
        let results = scanner.scan(&market(vec![sol]), Utc::now());

        assert!(!results[0].passed);
        assert_eq!(results[0].failed_stage(), Some(FilterStage::Liquidity));
        assert!(scanner.candidates(&results).is_empty());
    }

    #[test]
    fn test_volatility_stage_rejects() {
        let scanner = MarketScanner::new(loose_config());

        // 50 vs a 100 average: surge 0.5 under the 1.0 floor
        let quiet = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(50)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let results = scanner.scan(&market(vec![quiet]), Utc::now());
        assert_eq!(results[0].failed_stage(), Some(FilterStage::Volatility));
        assert_eq!(results[0].filters.len(), 3);
        assert!(results[0].metrics.volume_surge < 1.0);

        // ATR band too tight for a 2-point range
        let mut cfg = loose_config();
        cfg.max_atr_pct = 0.001;
        let sol = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let results = MarketScanner::new(cfg).scan(&market(vec![sol]), Utc::now());
        assert_eq!(results[0].failed_stage(), Some(FilterStage::Volatility));
        assert_eq!(results[0].filters.len(), 3);
    }

    #[test]
    fn test_watched_symbol_skips_surge_floor() {
        let scanner = MarketScanner::new(loose_config());
        let quiet = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(50)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let data = market(vec![quiet]);
        let watched: HashSet<String> = ["SOLUSDT".to_string()].into_iter().collect();

        let screened = scanner.screen_watching(&data, Utc::now(), &watched);
        assert!(screened[0].passed, "{:?}", screened[0].filters);
        assert!(!scanner.screen(&data, Utc::now())[0].passed);
    }

    #[test]
    fn test_correlation_stage_rejects() {
        let mut cfg = loose_config();
        cfg.reference_symbol = Some("BTCUSDT".into());
        let scanner = MarketScanner::new(cfg);

        // Identical candles: correlation 1.0 against the 0.85 cap
        let candles = breakout_candles(dec!(102.5), dec!(300));
        let sol = snapshot(
            "SOLUSDT",
            candles.clone(),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let btc = snapshot("BTCUSDT", candles, deep_book(dec!(102.5), dec!(500), dec!(300)));
        let data = MarketData::new(vec![sol, btc], Some("BTCUSDT".into()), Utc::now());
        let results = scanner.scan(&data, Utc::now());

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].symbol, "SOLUSDT");
        assert_eq!(results[0].failed_stage(), Some(FilterStage::Correlation));
        assert_eq!(results[0].filters.len(), 4);
        assert!(results[0].metrics.correlation.unwrap() > 0.99);
    }

    #[test]
    fn test_deny_list_short_circuits() {
        let mut cfg = loose_config();
        cfg.deny_list = vec!["SOLUSDT".into()];
        let scanner = MarketScanner::new(cfg);
        let sol = snapshot(
            "SOLUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let results = scanner.scan(&market(vec![sol]), Utc::now());
        assert_eq!(results[0].failed_stage(), Some(FilterStage::Universe));
        assert_eq!(results[0].filters.len(), 1);
    }

    #[test]
    fn test_equal_scores_break_on_depth() {
        let scanner = MarketScanner::new(loose_config());
        let candles = breakout_candles(dec!(102.5), dec!(300));
        // Both books far above min depth so the liquidity score saturates
        let shallow = snapshot(
            "AVAXUSDT",
            candles.clone(),
            deep_book(dec!(102.5), dec!(100000), dec!(100000)),
        );
        let deep = snapshot(
            "SOLUSDT",
            candles,
            deep_book(dec!(102.5), dec!(200000), dec!(200000)),
        );
        let results = scanner.scan(&market(vec![shallow, deep]), Utc::now());
        assert!(results.iter().all(|r| r.passed));
        assert!((results[0].score - results[1].score).abs() < 1e-12);
        assert_eq!(results[0].symbol, "SOLUSDT");
    }

    #[test]
    fn test_reference_symbol_not_a_candidate() {
        let mut cfg = loose_config();
        cfg.reference_symbol = Some("BTCUSDT".into());
        let scanner = MarketScanner::new(cfg);
        let btc = snapshot(
            "BTCUSDT",
            breakout_candles(dec!(102.5), dec!(300)),
            deep_book(dec!(102.5), dec!(500), dec!(300)),
        );
        let data = MarketData::new(vec![btc], Some("BTCUSDT".into()), Utc::now());
        assert!(scanner.scan(&data, Utc::now()).is_empty());
        assert!(scanner.requested_symbols().contains(&"BTCUSDT".to_string()));
    }
}
