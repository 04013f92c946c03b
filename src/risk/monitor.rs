use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::error::RiskError;

/// Account-level risk counters, written only by [`RiskMonitor`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub daily_start_equity: Decimal,
    pub daily_start_time: Option<DateTime<Utc>>,
    pub current_equity: Decimal,
    pub high_water_mark: Decimal,
    /// Percent, negative on losses (-3.1 = -3.1%)
    pub daily_pnl_pct: f64,
    pub current_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    /// Margin in use: sum of notional / max leverage
    pub used_equity: Decimal,
    /// Correlated risk as percent of equity
    pub correlation_exposure: f64,
    pub open_position_count: usize,
    pub consecutive_losses: u32,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Open-position exposure fed into a refresh
#[derive(Debug, Clone)]
pub struct PositionExposure {
    pub symbol: String,
    pub notional_usd: Decimal,
    /// Dollar loss if the current stop is hit
    pub risk_usd: Decimal,
    /// Correlation to the reference asset, if known
    pub correlation: Option<f64>,
}

pub struct RiskMonitor {
    config: RiskConfig,
    metrics: RiskMetrics,
    open_symbols: HashSet<String>,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            metrics: RiskMetrics::default(),
            open_symbols: HashSet::new(),
        }
    }

    pub fn metrics(&self) -> &RiskMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Swap limits on reload; counters and the kill-switch latch are kept
    pub fn set_config(&mut self, config: RiskConfig) {
        self.config = config;
    }

    pub fn has_open(&self, symbol: &str) -> bool {
        self.open_symbols.contains(symbol)
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.metrics.kill_switch_active
    }

    /// Most recent daily boundary at or before `now`
    fn daily_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour = self.config.daily_reset_hour_utc.min(23);
        let today = now.date_naive().and_hms_opt(hour, 0, 0).map(|t| Utc.from_utc_datetime(&t));
        match today {
            Some(boundary) if boundary <= now => boundary,
            Some(boundary) => boundary - Duration::days(1),
            None => now,
        }
    }

    /// Recompute all metrics for this cycle. Returns the kill-switch error if
    /// it tripped during this refresh.
    pub fn refresh(
        &mut self,
        equity: Decimal,
        exposures: &[PositionExposure],
        now: DateTime<Utc>,
    ) -> Option<RiskError> {
        let boundary = self.daily_boundary(now);
        let needs_reset = self
            .metrics
            .daily_start_time
            .map_or(true, |start| start < boundary);
        if needs_reset {
            if self.metrics.daily_start_time.is_some() {
                info!(
                    previous_pnl_pct = self.metrics.daily_pnl_pct,
                    "daily risk window reset"
                );
            }
            self.metrics.daily_start_equity = equity;
            self.metrics.daily_start_time = Some(boundary);
        }

        let m = &mut self.metrics;
        m.current_equity = equity;
        m.high_water_mark = m.high_water_mark.max(equity);
        m.daily_pnl_pct = pct_change(m.daily_start_equity, equity);
        m.current_drawdown_pct = if m.high_water_mark > Decimal::ZERO {
            ((m.high_water_mark - equity) / m.high_water_mark * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        m.max_drawdown_pct = m.max_drawdown_pct.max(m.current_drawdown_pct);

        let leverage = self.config.max_leverage.max(Decimal::ONE);
        m.used_equity = exposures.iter().map(|e| e.notional_usd).sum::<Decimal>() / leverage;

        let correlated_risk: f64 = exposures
            .iter()
            .filter_map(|e| {
                let corr = e.correlation?.abs();
                (corr >= self.config.correlation_threshold)
                    .then(|| e.risk_usd.to_f64().unwrap_or(0.0) * corr)
            })
            .sum();
        m.correlation_exposure = match equity.to_f64() {
            Some(eq) if eq > 0.0 => correlated_risk / eq * 100.0,
            _ => 0.0,
        };

        m.open_position_count = exposures.len();
        self.open_symbols = exposures.iter().map(|e| e.symbol.clone()).collect();
        m.updated_at = Some(now);

        self.evaluate_kill_switch()
    }

    fn evaluate_kill_switch(&mut self) -> Option<RiskError> {
        if self.metrics.kill_switch_active {
            return None;
        }

        let reason = if self.metrics.daily_pnl_pct <= -self.config.kill_switch_loss_pct {
            Some(format!(
                "daily pnl {:.2}% breached kill switch limit -{:.2}%",
                self.metrics.daily_pnl_pct, self.config.kill_switch_loss_pct
            ))
        } else if self.metrics.consecutive_losses > self.config.max_consecutive_losses {
            Some(format!(
                "{} consecutive losses exceeds {}",
                self.metrics.consecutive_losses, self.config.max_consecutive_losses
            ))
        } else {
            None
        };

        reason.map(|reason| self.trip_kill_switch(reason))
    }

    /// Latch the kill switch. Stays active until [`RiskMonitor::reset_kill_switch`].
    pub fn trip_kill_switch(&mut self, reason: impl Into<String>) -> RiskError {
        let reason = reason.into();
        error!(%reason, "KILL SWITCH TRIGGERED");
        self.metrics.kill_switch_active = true;
        self.metrics.kill_switch_reason = Some(reason.clone());
        RiskError::KillSwitch { reason }
    }

    pub fn reset_kill_switch(&mut self) {
        if self.metrics.kill_switch_active {
            warn!("kill switch reset");
        }
        self.metrics.kill_switch_active = false;
        self.metrics.kill_switch_reason = None;
        self.metrics.consecutive_losses = 0;
    }

    /// Feed a realized trade result into the loss streak
    pub fn record_trade_result(&mut self, pnl: Decimal) {
        if pnl < Decimal::ZERO {
            self.metrics.consecutive_losses += 1;
            warn!(
                %pnl,
                streak = self.metrics.consecutive_losses,
                "losing trade recorded"
            );
        } else {
            self.metrics.consecutive_losses = 0;
        }
    }

    /// Count a just-approved entry before the next refresh sees it
    pub fn reserve(&mut self, symbol: &str) {
        if self.open_symbols.insert(symbol.to_string()) {
            self.metrics.open_position_count += 1;
        }
    }

    /// Limit checks in fixed order: positions, daily loss, correlation exposure
    pub fn check_limits(&self) -> Result<(), RiskError> {
        let m = &self.metrics;
        let c = &self.config;

        if m.open_position_count >= c.max_concurrent_positions {
            return Err(RiskError::MaxPositions {
                open: m.open_position_count,
                limit: c.max_concurrent_positions,
            });
        }
        if m.daily_pnl_pct <= -c.daily_loss_limit_pct {
            return Err(RiskError::DailyLossLimit {
                pnl_pct: m.daily_pnl_pct,
                limit_pct: c.daily_loss_limit_pct,
            });
        }
        if m.correlation_exposure > c.max_correlation_exposure_pct {
            return Err(RiskError::CorrelationExposure {
                value: m.correlation_exposure,
                limit: c.max_correlation_exposure_pct,
            });
        }
        Ok(())
    }
}

fn pct_change(start: Decimal, now: Decimal) -> f64 {
    if start <= Decimal::ZERO {
        return 0.0;
    }
    ((now - start) / start * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn exposure(symbol: &str, risk: Decimal, corr: f64) -> PositionExposure {
        PositionExposure {
            symbol: symbol.into(),
            notional_usd: dec!(5000),
            risk_usd: risk,
            correlation: Some(corr),
        }
    }

    #[test]
    fn test_daily_pnl_and_drawdown() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());
        assert!(monitor.refresh(dec!(10000), &[], at(1)).is_none());
        monitor.refresh(dec!(10200), &[], at(2));
        monitor.refresh(dec!(9996), &[], at(3));

        let m = monitor.metrics();
        assert!((m.daily_pnl_pct + 0.04).abs() < 1e-9);
        assert_eq!(m.high_water_mark, dec!(10200));
        assert!((m.max_drawdown_pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_kill_switch_on_daily_loss() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());
        monitor.refresh(dec!(10000), &[], at(1));
        let tripped = monitor.refresh(dec!(9690), &[], at(2));

        assert!(matches!(tripped, Some(RiskError::KillSwitch { .. })));
        assert!(monitor.is_kill_switch_active());
        // Latched: recovering equity does not clear it
        assert!(monitor.refresh(dec!(10100), &[], at(3)).is_none());
        assert!(monitor.is_kill_switch_active());

        monitor.reset_kill_switch();
        assert!(!monitor.is_kill_switch_active());
    }

    #[test]
    fn test_kill_switch_on_loss_streak() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());
        for _ in 0..5 {
            monitor.record_trade_result(dec!(-10));
        }
        let tripped = monitor.refresh(dec!(10000), &[], at(1));
        assert!(tripped.is_some());
    }

    #[test]
    fn test_winning_trade_resets_streak() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());
        monitor.record_trade_result(dec!(-10));
        monitor.record_trade_result(dec!(-10));
        monitor.record_trade_result(dec!(5));
        assert_eq!(monitor.metrics().consecutive_losses, 0);
    }

    #[test]
    fn test_daily_reset_at_boundary() {
        let cfg = RiskConfig {
            daily_reset_hour_utc: 8,
            ..RiskConfig::default()
        };
        let mut monitor = RiskMonitor::new(cfg);
        monitor.refresh(dec!(10000), &[], at(7));
        monitor.refresh(dec!(9900), &[], at(7));
        assert!((monitor.metrics().daily_pnl_pct + 1.0).abs() < 1e-9);

        // Crossing 08:00 re-bases the day on current equity
        monitor.refresh(dec!(9900), &[], at(9));
        assert!(monitor.metrics().daily_pnl_pct.abs() < 1e-9);
        assert_eq!(monitor.metrics().daily_start_equity, dec!(9900));
    }

    #[test]
    fn test_check_limits_order() {
        let cfg = RiskConfig {
            max_concurrent_positions: 2,
            ..RiskConfig::default()
        };
        let mut monitor = RiskMonitor::new(cfg);
        monitor.refresh(dec!(10000), &[], at(1));
        monitor.refresh(
            dec!(9750),
            &[exposure("ETHUSDT", dec!(100), 0.9), exposure("SOLUSDT", dec!(100), 0.9)],
            at(2),
        );
        // Both positions and daily loss are breached; positions reported first
        assert!(matches!(
            monitor.check_limits(),
            Err(RiskError::MaxPositions { open: 2, limit: 2 })
        ));
    }

    #[test]
    fn test_correlation_exposure_counts_only_correlated() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());
        monitor.refresh(
            dec!(10000),
            &[exposure("ETHUSDT", dec!(200), 0.9), exposure("XRPUSDT", dec!(200), 0.2)],
            at(1),
        );
        // 200 x 0.9 / 10,000 = 1.8%
        assert!((monitor.metrics().correlation_exposure - 1.8).abs() < 1e-9);
        assert_eq!(monitor.metrics().used_equity, dec!(2000));
        assert!(monitor.has_open("XRPUSDT"));
    }

    #[test]
    fn test_correlation_exposure_cap() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());
        monitor.refresh(dec!(10000), &[exposure("ETHUSDT", dec!(400), 0.9)], at(1));
        assert_eq!(monitor.check_limits().unwrap_err().code(), "correlation_exposure");
    }
}
