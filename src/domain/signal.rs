use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;
use crate::error::{EngineError, Result};

/// Support below price, resistance above
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelKind {
    Support,
    Resistance,
}

impl LevelKind {
    /// Side a breakout through this level would trade
    pub fn breakout_side(&self) -> Side {
        match self {
            LevelKind::Resistance => Side::Long,
            LevelKind::Support => Side::Short,
        }
    }
}

/// Price level built from clustered swing points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub kind: LevelKind,
    /// Number of swing points merged into this level
    pub touches: u32,
    /// |price - last| / last
    pub distance_pct: f64,
}

/// Scanner pipeline stages, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Universe,
    Liquidity,
    Volatility,
    Correlation,
    Levels,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Universe => "universe",
            FilterStage::Liquidity => "liquidity",
            FilterStage::Volatility => "volatility",
            FilterStage::Correlation => "correlation",
            FilterStage::Levels => "levels",
        }
    }
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one scanner stage for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub stage: FilterStage,
    pub passed: bool,
    pub detail: String,
}

impl FilterOutcome {
    pub fn pass(stage: FilterStage) -> Self {
        Self {
            stage,
            passed: true,
            detail: String::new(),
        }
    }

    pub fn fail(stage: FilterStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Raw metrics computed while screening a symbol
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanMetrics {
    pub last_price: Decimal,
    pub quote_volume_24h: Decimal,
    pub spread_bps: f64,
    /// Two-sided depth inside the configured band
    pub depth_usd: Decimal,
    pub atr: Decimal,
    pub atr_pct: f64,
    pub bollinger_width: f64,
    pub volume_surge: f64,
    /// None when no reference asset is available
    pub correlation: Option<f64>,
    pub nearest_level_distance_pct: Option<f64>,
}

/// Per-symbol scanner output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub symbol: String,
    pub score: f64,
    pub passed: bool,
    pub filters: Vec<FilterOutcome>,
    pub levels: Vec<Level>,
    pub metrics: ScanMetrics,
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    /// First stage that rejected this symbol
    pub fn failed_stage(&self) -> Option<FilterStage> {
        self.filters.iter().find(|f| !f.passed).map(|f| f.stage)
    }

    pub fn nearest_level(&self, kind: LevelKind) -> Option<&Level> {
        self.levels
            .iter()
            .filter(|l| l.kind == kind)
            .min_by(|a, b| a.distance_pct.total_cmp(&b.distance_pct))
    }
}

/// Which entry strategy produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Momentum,
    Retest,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "momentum",
            StrategyKind::Retest => "retest",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry signal. Consumed once by the risk manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub strategy: StrategyKind,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    /// Level(s) the signal was derived from
    pub levels: Vec<Level>,
    /// ATR at signal time, carried into position management
    pub atr: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Per-unit risk |entry - stop|
    pub fn risk_per_unit(&self) -> Decimal {
        (self.entry_price - self.stop_price).abs()
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_price <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "{}: entry price must be positive",
                self.symbol
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::validation(format!(
                "{}: confidence {} outside [0, 1]",
                self.symbol, self.confidence
            )));
        }
        validate_stop(self.side, self.entry_price, self.stop_price)
    }
}

/// Stop must sit below entry for longs and above for shorts
pub fn validate_stop(side: Side, entry: Decimal, stop: Decimal) -> Result<()> {
    let ok = match side {
        Side::Long => stop < entry,
        Side::Short => stop > entry,
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::invariant(format!(
            "{} stop {} on wrong side of entry {}",
            side, stop, entry
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal(side: Side, stop: Decimal, confidence: f64) -> Signal {
        Signal {
            symbol: "SOLUSDT".into(),
            side,
            strategy: StrategyKind::Momentum,
            entry_price: dec!(100),
            stop_price: stop,
            confidence,
            levels: vec![],
            atr: dec!(2),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_signal_validation() {
        assert!(signal(Side::Long, dec!(98), 0.7).validate().is_ok());
        assert!(signal(Side::Short, dec!(102), 0.7).validate().is_ok());
        assert!(signal(Side::Long, dec!(102), 0.7).validate().is_err());
        assert!(signal(Side::Long, dec!(98), 1.2).validate().is_err());
        assert_eq!(signal(Side::Long, dec!(98), 0.7).risk_per_unit(), dec!(2));
    }

    #[test]
    fn test_failed_stage_reports_first_failure() {
        let result = ScanResult {
            symbol: "XRPUSDT".into(),
            score: 0.0,
            passed: false,
            filters: vec![
                FilterOutcome::pass(FilterStage::Universe),
                FilterOutcome::fail(FilterStage::Liquidity, "spread 40bps > 10bps"),
            ],
            levels: vec![],
            metrics: ScanMetrics::default(),
            scanned_at: Utc::now(),
        };
        assert_eq!(result.failed_stage(), Some(FilterStage::Liquidity));
    }
}
