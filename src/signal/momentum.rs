use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use super::{broken_level, EntryStrategy};
use crate::config::{MomentumConfig, SignalConfig};
use crate::domain::{MarketSnapshot, ScanResult, Side, Signal, StrategyKind};
use crate::indicators;

/// Breakout-with-confirmation entry: close through a level on surging
/// volume, supportive book imbalance and a full-bodied candle.
pub struct MomentumStrategy {
    config: MomentumConfig,
    atr_period: usize,
    volume_lookback: usize,
    imbalance_band_pct: Decimal,
}

impl MomentumStrategy {
    pub fn new(signals: &SignalConfig) -> Self {
        Self {
            config: signals.momentum.clone(),
            atr_period: signals.atr_period,
            volume_lookback: signals.volume_lookback,
            imbalance_band_pct: signals.imbalance_band_pct,
        }
    }

    /// Margin of `value` over `threshold` scaled to [0, 1] by `span`
    fn margin(value: f64, threshold: f64, span: f64) -> f64 {
        if span <= 0.0 {
            return 0.0;
        }
        ((value - threshold) / span).clamp(0.0, 1.0)
    }

    pub(crate) fn confidence(&self, surge: f64, imbalance: f64, body: f64, atr_distance: f64) -> f64 {
        let c = &self.config;
        let surge_m = Self::margin(surge, c.min_volume_surge, c.min_volume_surge);
        let imbalance_m = Self::margin(imbalance, c.min_imbalance, 1.0 - c.min_imbalance);
        let body_m = Self::margin(body, c.min_body_ratio, 1.0 - c.min_body_ratio);
        let distance_m = atr_distance.clamp(0.0, 1.0);

        let blended = c.surge_weight * surge_m
            + c.imbalance_weight * imbalance_m
            + c.body_weight * body_m
            + c.distance_weight * distance_m;
        (c.base_confidence + (1.0 - c.base_confidence) * blended).clamp(0.0, 1.0)
    }
}

impl EntryStrategy for MomentumStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn evaluate(
        &mut self,
        candidate: &ScanResult,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let candles = &snapshot.candles;
        let last = candles.last()?;
        let level = broken_level(candidate, candles)?;
        let side = level.kind.breakout_side();

        let directional = match side {
            Side::Long => last.is_bullish(),
            Side::Short => last.is_bearish(),
        };
        if !directional {
            return None;
        }

        let atr = indicators::atr(candles, self.atr_period)?;
        let surge = indicators::volume_surge(candles, self.volume_lookback)?;
        let imbalance = snapshot
            .order_book
            .imbalance(side, self.imbalance_band_pct);
        let body = last.body_ratio();

        if surge < self.config.min_volume_surge
            || imbalance < self.config.min_imbalance
            || body < self.config.min_body_ratio
        {
            debug!(
                symbol = %candidate.symbol,
                surge, imbalance, body,
                "momentum breakout without confirmation"
            );
            return None;
        }

        let atr_distance = if atr > Decimal::ZERO {
            ((last.close - level.price).abs() / atr).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        let confidence = self.confidence(surge, imbalance, body, atr_distance);

        let offset = atr * self.config.atr_stop_buffer;
        let stop_price = match side {
            Side::Long => level.price - offset,
            Side::Short => level.price + offset,
        };

        Some(Signal {
            symbol: candidate.symbol.clone(),
            side,
            strategy: StrategyKind::Momentum,
            entry_price: last.close,
            stop_price,
            confidence,
            levels: vec![level.clone()],
            atr,
            created_at: now,
        })
    }
}
