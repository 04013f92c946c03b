use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::domain::StrategyKind;
use crate::error::{EngineError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    /// Named trading presets
    #[serde(default)]
    pub presets: BTreeMap<String, TradingPreset>,
}

/// Engine loop settings (not part of a preset, survive reloads)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between ticks in milliseconds
    pub tick_interval_ms: u64,
    /// Aggregate deadline for one stage's fan-out in milliseconds
    pub cycle_deadline_ms: u64,
    /// Concurrent venue calls per fan-out
    pub worker_pool_size: usize,
    /// Symbols per market-data request
    pub snapshot_chunk_size: usize,
    /// Levels requested when refreshing an order book
    pub order_book_depth: usize,
    /// Bounded transition history
    pub history_capacity: usize,
    pub recent_signals_capacity: usize,
    pub closed_positions_capacity: usize,
    pub event_channel_capacity: usize,
    pub default_preset: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            cycle_deadline_ms: 20_000,
            worker_pool_size: 8,
            snapshot_chunk_size: 10,
            order_book_depth: 50,
            history_capacity: 256,
            recent_signals_capacity: 50,
            closed_positions_capacity: 200,
            event_channel_capacity: 256,
            default_preset: "default".to_string(),
        }
    }
}

/// Simulated venue used in paper mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_equity: Decimal,
    /// Fee charged on every fill, as a fraction of notional
    pub taker_fee_rate: Decimal,
    /// Leverage used to compute margin for `available` balance
    pub leverage: Decimal,
    pub supports_iceberg: bool,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_equity: dec!(10000),
            taker_fee_rate: dec!(0.0004),
            leverage: dec!(5),
            supports_iceberg: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Immutable parameter set handed to the engine whole at start/reload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingPreset {
    pub scanner: ScannerConfig,
    pub signals: SignalConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub position: PositionConfig,
}

/// Scoring weights for the scanner, must sum to 1.0
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub liquidity: f64,
    pub volatility: f64,
    pub volume: f64,
    pub correlation: f64,
    pub level_proximity: f64,
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.liquidity + self.volatility + self.volume + self.correlation + self.level_proximity
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            liquidity: 0.25,
            volatility: 0.2,
            volume: 0.25,
            correlation: 0.1,
            level_proximity: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Symbols requested from the market-data provider each cycle
    pub universe: Vec<String>,
    /// When non-empty, only these symbols are considered
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    /// Reference asset for correlation (e.g. BTCUSDT)
    pub reference_symbol: Option<String>,

    // Liquidity
    pub min_quote_volume_usd: Decimal,
    pub max_spread_bps: f64,
    /// Depth band around mid (0.01 = 1%)
    pub depth_band_pct: Decimal,
    pub min_depth_usd: Decimal,

    // Volatility
    pub atr_period: usize,
    pub min_atr_pct: f64,
    pub max_atr_pct: f64,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
    pub min_bb_width: f64,
    pub max_bb_width: f64,
    pub volume_lookback: usize,
    pub min_volume_surge: f64,

    // Correlation
    pub max_correlation: f64,
    pub correlation_lookback: usize,

    // Levels
    pub swing_strength: usize,
    pub level_lookback: usize,
    pub level_cluster_tolerance_pct: f64,
    pub max_level_distance_pct: f64,
    pub max_levels: usize,

    /// Passing candidates forwarded to signal evaluation
    pub max_candidates: usize,
    pub weights: ScoreWeights,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            universe: vec![
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
                "BNBUSDT".to_string(),
                "XRPUSDT".to_string(),
                "DOGEUSDT".to_string(),
            ],
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            reference_symbol: Some("BTCUSDT".to_string()),
            min_quote_volume_usd: dec!(50000000),
            max_spread_bps: 10.0,
            depth_band_pct: dec!(0.01),
            min_depth_usd: dec!(250000),
            atr_period: 14,
            min_atr_pct: 0.002,
            max_atr_pct: 0.05,
            bollinger_period: 20,
            bollinger_k: 2.0,
            min_bb_width: 0.005,
            max_bb_width: 0.2,
            volume_lookback: 20,
            min_volume_surge: 1.2,
            max_correlation: 0.85,
            correlation_lookback: 50,
            swing_strength: 2,
            level_lookback: 100,
            level_cluster_tolerance_pct: 0.003,
            max_level_distance_pct: 0.03,
            max_levels: 4,
            max_candidates: 10,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub enabled: bool,
    pub min_volume_surge: f64,
    pub min_imbalance: f64,
    pub min_body_ratio: f64,
    /// Stop sits this many ATRs beyond the broken level
    pub atr_stop_buffer: Decimal,
    pub base_confidence: f64,
    pub surge_weight: f64,
    pub imbalance_weight: f64,
    pub body_weight: f64,
    pub distance_weight: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_volume_surge: 2.0,
            min_imbalance: 0.6,
            min_body_ratio: 0.5,
            atr_stop_buffer: dec!(0.5),
            base_confidence: 0.5,
            surge_weight: 0.35,
            imbalance_weight: 0.35,
            body_weight: 0.15,
            distance_weight: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetestConfig {
    pub enabled: bool,
    /// How long a recorded breakout stays eligible for a retest
    pub breakout_ttl_secs: i64,
    /// Max distance from the level counted as a retest (0.002 = 0.2%)
    pub tolerance_pct: Decimal,
    /// Tighter than the momentum buffer
    pub atr_stop_buffer: Decimal,
    /// Volume surge a breakout needs to be recorded
    pub min_breakout_surge: f64,
    pub base_confidence: f64,
}

impl Default for RetestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            breakout_ttl_secs: 4 * 3600,
            tolerance_pct: dec!(0.002),
            atr_stop_buffer: dec!(0.25),
            min_breakout_surge: 1.5,
            base_confidence: 0.55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Strategy priority, first wins on equal confidence
    pub priority: Vec<StrategyKind>,
    pub atr_period: usize,
    pub volume_lookback: usize,
    /// Band used for the L2 imbalance reading
    pub imbalance_band_pct: Decimal,
    pub momentum: MomentumConfig,
    pub retest: RetestConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            priority: vec![StrategyKind::Retest, StrategyKind::Momentum],
            atr_period: 14,
            volume_lookback: 20,
            imbalance_band_pct: dec!(0.01),
            momentum: MomentumConfig::default(),
            retest: RetestConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade (0.01 = 1%)
    pub risk_per_trade: Decimal,
    pub max_leverage: Decimal,
    /// Max share of consumable book depth one order may take
    pub max_depth_fraction: Decimal,
    pub depth_band_pct: Decimal,
    /// Venue quantity increment
    pub lot_step: Decimal,
    /// Venue price increment
    pub tick_size: Decimal,
    pub min_notional_usd: Decimal,
    pub max_concurrent_positions: usize,
    /// Percent of day-start equity (2.0 = 2%)
    pub daily_loss_limit_pct: f64,
    pub kill_switch_loss_pct: f64,
    pub max_consecutive_losses: u32,
    /// Positions at or above this |corr| count toward correlation exposure
    pub correlation_threshold: f64,
    /// Cap on correlated risk as percent of equity
    pub max_correlation_exposure_pct: f64,
    /// Cap on a new signal's own |corr| to the reference asset
    pub max_signal_correlation: f64,
    pub daily_reset_hour_utc: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.01),
            max_leverage: dec!(5),
            max_depth_fraction: dec!(0.1),
            depth_band_pct: dec!(0.01),
            lot_step: dec!(0.001),
            tick_size: dec!(0.0001),
            min_notional_usd: dec!(5),
            max_concurrent_positions: 3,
            daily_loss_limit_pct: 2.0,
            kill_switch_loss_pct: 3.0,
            max_consecutive_losses: 4,
            correlation_threshold: 0.5,
            max_correlation_exposure_pct: 3.0,
            max_signal_correlation: 0.8,
            daily_reset_hour_utc: 0,
        }
    }
}

/// Token bucket for one endpoint category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub market_data: BucketConfig,
    pub order: BucketConfig,
    pub account: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            market_data: BucketConfig {
                capacity: 40,
                refill_per_sec: 20.0,
            },
            order: BucketConfig {
                capacity: 10,
                refill_per_sec: 5.0,
            },
            account: BucketConfig {
                capacity: 10,
                refill_per_sec: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-call timeout in milliseconds
    pub order_timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
    /// Notional/depth at or below which a single order is used
    pub single_max_depth_ratio: f64,
    /// Notional/depth at or above which iceberg is preferred (if supported)
    pub iceberg_min_depth_ratio: f64,
    pub max_twap_slices: u32,
    pub twap_interval_ms: u64,
    /// Visible share of an iceberg order
    pub iceberg_display_fraction: Decimal,
    /// Limit price offset from touch for entries
    pub max_slippage_bps: Decimal,
    pub depth_band_pct: Decimal,
    pub rate_limits: RateLimitConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: 5_000,
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            backoff_jitter: true,
            single_max_depth_ratio: 0.05,
            iceberg_min_depth_ratio: 0.25,
            max_twap_slices: 5,
            twap_interval_ms: 500,
            iceberg_display_fraction: dec!(0.2),
            max_slippage_bps: dec!(15),
            depth_band_pct: dec!(0.01),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Breakeven stop offset as a fraction of entry (0.001 = 0.1%)
    pub fee_buffer_pct: Decimal,
    pub tp1_r: f64,
    /// Share of remaining quantity closed at TP1 (0.5 = 50%)
    pub tp1_close_pct: Decimal,
    pub tp2_r: f64,
    pub tp2_close_pct: Decimal,
    pub atr_period: usize,
    /// Chandelier multiple
    pub trailing_atr_multiple: Decimal,
    pub trailing_lookback: usize,
    pub add_on_enabled: bool,
    pub add_on_min_r: f64,
    /// Add-on size as a fraction of the initial quantity
    pub add_on_fraction: Decimal,
    pub add_on_ma_period: usize,
    pub add_on_tolerance_pct: Decimal,
    pub max_hold_minutes: i64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            fee_buffer_pct: dec!(0.001),
            tp1_r: 1.0,
            tp1_close_pct: dec!(0.5),
            tp2_r: 2.0,
            tp2_close_pct: dec!(0.5),
            atr_period: 14,
            trailing_atr_multiple: dec!(3),
            trailing_lookback: 22,
            add_on_enabled: true,
            add_on_min_r: 0.5,
            add_on_fraction: dec!(0.5),
            add_on_ma_period: 9,
            add_on_tolerance_pct: dec!(0.003),
            max_hold_minutes: 24 * 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("engine.default_preset", "default")?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("BREAKOUT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (BREAKOUT_ENGINE__TICK_INTERVAL_MS, etc.)
            .add_source(
                Environment::with_prefix("BREAKOUT")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        if cfg.presets.is_empty() {
            cfg.presets
                .insert(cfg.engine.default_preset.clone(), TradingPreset::default());
        }
        Ok(cfg)
    }

    /// Built-in configuration with a single "default" preset
    pub fn default_config() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert("default".to_string(), TradingPreset::default());
        Self {
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            paper: PaperConfig::default(),
            presets,
        }
    }

    /// Look up and validate a preset by name
    pub fn preset(&self, name: &str) -> Result<TradingPreset> {
        let preset = self
            .presets
            .get(name)
            .ok_or_else(|| EngineError::validation(format!("unknown preset: {name}")))?;
        preset
            .validate()
            .map_err(|errors| EngineError::validation(format!("{name}: {}", errors.join("; "))))?;
        Ok(preset.clone())
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine.tick_interval_ms == 0 {
            errors.push("engine.tick_interval_ms must be positive".to_string());
        }
        if self.engine.worker_pool_size == 0 {
            errors.push("engine.worker_pool_size must be positive".to_string());
        }
        if self.engine.snapshot_chunk_size == 0 {
            errors.push("engine.snapshot_chunk_size must be positive".to_string());
        }
        if self.engine.history_capacity == 0 {
            errors.push("engine.history_capacity must be positive".to_string());
        }
        if self.paper.initial_equity <= Decimal::ZERO {
            errors.push("paper.initial_equity must be positive".to_string());
        }
        if self.paper.taker_fee_rate < Decimal::ZERO || self.paper.taker_fee_rate >= Decimal::ONE {
            errors.push("paper.taker_fee_rate must be in [0, 1)".to_string());
        }
        if self.paper.leverage <= Decimal::ZERO {
            errors.push("paper.leverage must be positive".to_string());
        }
        if !self.presets.contains_key(&self.engine.default_preset) {
            errors.push(format!(
                "engine.default_preset '{}' is not defined",
                self.engine.default_preset
            ));
        }

        for (name, preset) in &self.presets {
            if let Err(preset_errors) = preset.validate() {
                errors.extend(preset_errors.into_iter().map(|e| format!("presets.{name}: {e}")));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn unit_fraction(errors: &mut Vec<String>, field: &str, value: Decimal) {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        errors.push(format!("{field} must be in (0, 1]"));
    }
}

fn ordered_range(errors: &mut Vec<String>, field: &str, min: f64, max: f64) {
    if min < 0.0 || min > max {
        errors.push(format!("{field}: min {min} must be non-negative and <= max {max}"));
    }
}

impl TradingPreset {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let s = &self.scanner;
        let sig = &self.signals;
        let r = &self.risk;
        let e = &self.execution;
        let p = &self.position;

        // Scanner
        let weight_sum = s.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            errors.push(format!("scanner.weights must sum to 1.0, got {weight_sum:.6}"));
        }
        let w = &s.weights;
        if [w.liquidity, w.volatility, w.volume, w.correlation, w.level_proximity]
            .iter()
            .any(|x| *x < 0.0)
        {
            errors.push("scanner.weights must be non-negative".to_string());
        }
        ordered_range(&mut errors, "scanner.atr_pct", s.min_atr_pct, s.max_atr_pct);
        ordered_range(&mut errors, "scanner.bb_width", s.min_bb_width, s.max_bb_width);
        unit_fraction(&mut errors, "scanner.depth_band_pct", s.depth_band_pct);
        if !(0.0..=1.0).contains(&s.max_correlation) {
            errors.push("scanner.max_correlation must be in [0, 1]".to_string());
        }
        if s.atr_period == 0 || s.bollinger_period < 2 || s.volume_lookback == 0 {
            errors.push("scanner indicator periods must be positive".to_string());
        }
        if s.swing_strength == 0 {
            errors.push("scanner.swing_strength must be positive".to_string());
        }
        if s.max_level_distance_pct <= 0.0 {
            errors.push("scanner.max_level_distance_pct must be positive".to_string());
        }

        // Signals
        if sig.priority.is_empty() {
            errors.push("signals.priority must list at least one strategy".to_string());
        }
        let unique: HashSet<_> = sig.priority.iter().collect();
        if unique.len() != sig.priority.len() {
            errors.push("signals.priority contains duplicates".to_string());
        }
        let m = &sig.momentum;
        if !(0.0..1.0).contains(&m.min_imbalance) {
            errors.push("signals.momentum.min_imbalance must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&m.min_body_ratio) {
            errors.push("signals.momentum.min_body_ratio must be in [0, 1)".to_string());
        }
        if m.min_volume_surge <= 0.0 {
            errors.push("signals.momentum.min_volume_surge must be positive".to_string());
        }
        let momentum_weights =
            m.surge_weight + m.imbalance_weight + m.body_weight + m.distance_weight;
        if (momentum_weights - 1.0).abs() > 1e-6 {
            errors.push(format!(
                "signals.momentum weights must sum to 1.0, got {momentum_weights:.6}"
            ));
        }
        if m.atr_stop_buffer <= Decimal::ZERO || sig.retest.atr_stop_buffer <= Decimal::ZERO {
            errors.push("signals atr_stop_buffer must be positive".to_string());
        }
        if sig.retest.breakout_ttl_secs <= 0 {
            errors.push("signals.retest.breakout_ttl_secs must be positive".to_string());
        }

        // Risk
        unit_fraction(&mut errors, "risk.risk_per_trade", r.risk_per_trade);
        unit_fraction(&mut errors, "risk.max_depth_fraction", r.max_depth_fraction);
        if r.max_leverage < Decimal::ONE {
            errors.push("risk.max_leverage must be >= 1".to_string());
        }
        if r.lot_step <= Decimal::ZERO {
            errors.push("risk.lot_step must be positive".to_string());
        }
        if r.tick_size <= Decimal::ZERO {
            errors.push("risk.tick_size must be positive".to_string());
        }
        if r.max_concurrent_positions == 0 {
            errors.push("risk.max_concurrent_positions must be positive".to_string());
        }
        if r.daily_loss_limit_pct <= 0.0 || r.kill_switch_loss_pct <= 0.0 {
            errors.push("risk loss limits must be positive".to_string());
        }
        if r.daily_loss_limit_pct > r.kill_switch_loss_pct {
            errors.push(
                "risk.daily_loss_limit_pct should not exceed risk.kill_switch_loss_pct".to_string(),
            );
        }
        if r.daily_reset_hour_utc > 23 {
            errors.push("risk.daily_reset_hour_utc must be 0-23".to_string());
        }

        // Execution
        ordered_range(
            &mut errors,
            "execution.depth_ratio",
            e.single_max_depth_ratio,
            e.iceberg_min_depth_ratio,
        );
        if e.max_twap_slices < 2 {
            errors.push("execution.max_twap_slices must be >= 2".to_string());
        }
        unit_fraction(
            &mut errors,
            "execution.iceberg_display_fraction",
            e.iceberg_display_fraction,
        );
        if e.order_timeout_ms == 0 {
            errors.push("execution.order_timeout_ms must be positive".to_string());
        }
        for (name, bucket) in [
            ("market_data", &e.rate_limits.market_data),
            ("order", &e.rate_limits.order),
            ("account", &e.rate_limits.account),
        ] {
            if bucket.capacity == 0 || bucket.refill_per_sec <= 0.0 {
                errors.push(format!("execution.rate_limits.{name} must be positive"));
            }
        }

        // Position management
        if p.tp1_r <= 0.0 || p.tp2_r <= p.tp1_r {
            errors.push("position: require 0 < tp1_r < tp2_r".to_string());
        }
        unit_fraction(&mut errors, "position.tp1_close_pct", p.tp1_close_pct);
        unit_fraction(&mut errors, "position.tp2_close_pct", p.tp2_close_pct);
        unit_fraction(&mut errors, "position.add_on_fraction", p.add_on_fraction);
        if p.fee_buffer_pct < Decimal::ZERO {
            errors.push("position.fee_buffer_pct must be non-negative".to_string());
        }
        if p.trailing_atr_multiple <= Decimal::ZERO || p.trailing_lookback == 0 {
            errors.push("position trailing parameters must be positive".to_string());
        }
        if p.max_hold_minutes <= 0 {
            errors.push("position.max_hold_minutes must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default_config();
        assert!(cfg.validate().is_ok(), "{:?}", cfg.validate());
        assert!(cfg.preset("default").is_ok());
        assert!(cfg.preset("missing").is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut preset = TradingPreset::default();
        preset.scanner.weights.liquidity = 0.5;
        let errors = preset.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("scanner.weights")));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut preset = TradingPreset::default();
        preset.risk.risk_per_trade = dec!(1.5);
        preset.position.tp2_r = 0.5;
        preset.risk.daily_loss_limit_pct = 5.0;
        let errors = preset.validate().unwrap_err();
        assert!(errors.len() >= 3, "{errors:?}");
    }

    #[test]
    fn test_preset_deserializes_partial() {
        let json = r#"{ "risk": { "risk_per_trade": "0.02" }, "signals": { "priority": ["momentum"] } }"#;
        let preset: TradingPreset = serde_json::from_str(json).unwrap();
        assert_eq!(preset.risk.risk_per_trade, dec!(0.02));
        assert_eq!(preset.signals.priority, vec![StrategyKind::Momentum]);
        assert_eq!(preset.risk.max_concurrent_positions, 3);
    }
}
