//! Risk management: position sizing plus account-level limits and the kill switch.

mod monitor;
mod sizer;

pub use monitor::{PositionExposure, RiskMetrics, RiskMonitor};
pub use sizer::PositionSizer;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::domain::{OrderBook, PositionSize, Signal};
use crate::error::RiskError;

/// Sizing and limit checks for new signals
pub struct RiskManager {
    config: RiskConfig,
    sizer: PositionSizer,
    monitor: RiskMonitor,
    /// Operator halt (pause / emergency stop), separate from the kill switch
    halt_reason: Option<String>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            sizer: PositionSizer::new(config.clone()),
            monitor: RiskMonitor::new(config.clone()),
            config,
            halt_reason: None,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn monitor(&self) -> &RiskMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut RiskMonitor {
        &mut self.monitor
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub fn metrics(&self) -> &RiskMetrics {
        self.monitor.metrics()
    }

    /// Apply a reloaded preset without losing counters
    pub fn reconfigure(&mut self, config: RiskConfig) {
        self.sizer = PositionSizer::new(config.clone());
        self.monitor.set_config(config.clone());
        self.config = config;
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "new entries halted");
        self.halt_reason = Some(reason);
    }

    pub fn resume(&mut self) {
        if self.halt_reason.take().is_some() {
            info!("new entries resumed");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason.is_some()
    }

    /// Whether any new entry may be considered at all
    pub fn entries_allowed(&self) -> bool {
        !self.is_halted() && !self.monitor.is_kill_switch_active()
    }

    /// Full pre-trade check for one signal. `correlation` is the signal's
    /// correlation to the reference asset (from the scan).
    ///
    /// Order: signal validity, kill switch, halt, duplicate symbol, account
    /// limits, per-signal correlation cap, sizing.
    pub fn evaluate_signal_risk(
        &self,
        signal: &Signal,
        correlation: Option<f64>,
        equity: Decimal,
        book: &OrderBook,
    ) -> Result<PositionSize, RiskError> {
        signal
            .validate()
            .map_err(|e| RiskError::InvalidSignal(e.to_string()))?;

        if let Some(reason) = &self.monitor.metrics().kill_switch_reason {
            return Err(RiskError::KillSwitch {
                reason: reason.clone(),
            });
        }
        if let Some(reason) = &self.halt_reason {
            return Err(RiskError::TradingHalted {
                reason: reason.clone(),
            });
        }
        if self.monitor.has_open(&signal.symbol) {
            return Err(RiskError::DuplicateSymbol {
                symbol: signal.symbol.clone(),
            });
        }

        self.monitor.check_limits()?;

        if let Some(corr) = correlation {
            if corr.abs() > self.config.max_signal_correlation {
                return Err(RiskError::CorrelationExposure {
                    value: corr.abs(),
                    limit: self.config.max_signal_correlation,
                });
            }
        }

        let size = self.sizer.size(signal, equity, book);
        if !size.valid {
            return Err(RiskError::Sizing {
                reason: size
                    .rejection_reason
                    .unwrap_or_else(|| "rejected".to_string()),
            });
        }
        Ok(size)
    }

    /// Evaluate and, on approval, reserve the slot so later signals in the
    /// same batch see it
    pub fn approve(
        &mut self,
        signal: &Signal,
        correlation: Option<f64>,
        equity: Decimal,
        book: &OrderBook,
    ) -> Result<PositionSize, RiskError> {
        match self.evaluate_signal_risk(signal, correlation, equity, book) {
            Ok(size) => {
                self.monitor.reserve(&signal.symbol);
                info!(
                    symbol = %size.symbol,
                    side = %size.side,
                    quantity = %size.quantity,
                    notional = %size.notional_usd.round_dp(2),
                    risk = %size.risk_usd.round_dp(2),
                    "signal approved"
                );
                Ok(size)
            }
            Err(e) => {
                debug!(symbol = %signal.symbol, code = e.code(), reason = %e, "signal rejected");
                Err(e)
            }
        }
    }
}
