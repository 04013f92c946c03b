use rust_decimal::Decimal;
use tracing::debug;

use crate::config::RiskConfig;
use crate::domain::{OrderBook, PositionSize, Signal};

/// Fixed-fractional position sizing bounded by book depth and leverage
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Quantity risking exactly `risk_per_trade` of equity, before any clamping
    pub fn raw_quantity(&self, signal: &Signal, equity: Decimal) -> Option<Decimal> {
        let risk_per_unit = signal.risk_per_unit();
        if risk_per_unit <= Decimal::ZERO || equity <= Decimal::ZERO {
            return None;
        }
        Some(equity * self.config.risk_per_trade / risk_per_unit)
    }

    pub fn size(&self, signal: &Signal, equity: Decimal, book: &OrderBook) -> PositionSize {
        let reject = |reason: String| {
            debug!(symbol = %signal.symbol, %reason, "sizing rejected");
            PositionSize::rejected(
                &signal.symbol,
                signal.side,
                signal.entry_price,
                signal.stop_price,
                reason,
            )
        };

        let Some(mut quantity) = self.raw_quantity(signal, equity) else {
            return reject(format!(
                "no risk budget (equity {}, stop distance {})",
                equity,
                signal.risk_per_unit()
            ));
        };
        let entry = signal.entry_price;

        // Bound slippage: never take more than a fraction of consumable depth
        let depth = book.consumable_depth_usd(signal.side.entry_order_side(), self.config.depth_band_pct);
        let depth_cap = depth * self.config.max_depth_fraction;
        if quantity * entry > depth_cap {
            quantity = depth_cap / entry;
        }

        let leverage_cap = equity * self.config.max_leverage;
        if quantity * entry > leverage_cap {
            quantity = leverage_cap / entry;
        }

        quantity = self.round_to_lot(quantity);
        if quantity <= Decimal::ZERO {
            return reject("quantity rounds to zero".to_string());
        }

        let notional = quantity * entry;
        if notional < self.config.min_notional_usd {
            return reject(format!(
                "notional {} below venue minimum {}",
                notional.round_dp(2),
                self.config.min_notional_usd
            ));
        }

        PositionSize::approved(&signal.symbol, signal.side, entry, signal.stop_price, quantity)
    }

    /// Round down to the venue lot step
    pub fn round_to_lot(&self, quantity: Decimal) -> Decimal {
        let step = self.config.lot_step;
        if step <= Decimal::ZERO {
            return quantity;
        }
        (quantity / step).floor() * step
    }
}
