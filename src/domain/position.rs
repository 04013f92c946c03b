use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{validate_stop, Side, StrategyKind};
use crate::error::{EngineError, Result};

pub type PositionId = u64;

/// Position lifecycle. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, PositionStatus::Closed)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::PartiallyClosed => write!(f, "PARTIALLY_CLOSED"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Sizing output for one order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub quantity: Decimal,
    pub notional_usd: Decimal,
    pub risk_usd: Decimal,
    pub valid: bool,
    pub rejection_reason: Option<String>,
}

impl PositionSize {
    pub fn approved(
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            entry_price,
            stop_price,
            quantity,
            notional_usd: quantity * entry_price,
            risk_usd: quantity * (entry_price - stop_price).abs(),
            valid: true,
            rejection_reason: None,
        }
    }

    pub fn rejected(
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        stop_price: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            entry_price,
            stop_price,
            quantity: Decimal::ZERO,
            notional_usd: Decimal::ZERO,
            risk_usd: Decimal::ZERO,
            valid: false,
            rejection_reason: Some(reason.into()),
        }
    }
}

/// Open or archived position. Quantities are always positive; `side` gives direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub strategy: StrategyKind,
    /// Remaining quantity
    pub quantity: Decimal,
    /// Quantity of the first fill
    pub initial_quantity: Decimal,
    /// Everything ever bought/sold into the position (entry plus add-ons)
    pub opened_quantity: Decimal,
    /// Everything closed so far
    pub closed_quantity: Decimal,
    /// Volume-weighted entry price
    pub entry_price: Decimal,
    pub initial_stop: Decimal,
    pub stop_price: Decimal,
    pub status: PositionStatus,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    /// Realized plus unrealized at the last mark
    pub pnl_usd: Decimal,
    pub pnl_r: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: PositionId,
        symbol: &str,
        side: Side,
        strategy: StrategyKind,
        quantity: Decimal,
        entry_price: Decimal,
        stop_price: Decimal,
        fee: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<Self> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::invariant(format!(
                "{}: opening quantity must be positive, got {}",
                symbol, quantity
            )));
        }
        validate_stop(side, entry_price, stop_price)?;

        Ok(Self {
            id,
            symbol: symbol.to_string(),
            side,
            strategy,
            quantity,
            initial_quantity: quantity,
            opened_quantity: quantity,
            closed_quantity: Decimal::ZERO,
            entry_price,
            initial_stop: stop_price,
            stop_price,
            status: PositionStatus::Open,
            realized_pnl: -fee,
            fees: fee,
            pnl_usd: -fee,
            pnl_r: 0.0,
            opened_at,
            closed_at: None,
            meta: BTreeMap::new(),
        })
    }

    /// |entry - initial stop|, the unit of R
    pub fn risk_per_unit(&self) -> Decimal {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Dollar risk taken at entry
    pub fn initial_risk_usd(&self) -> Decimal {
        self.risk_per_unit() * self.initial_quantity
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// Favorable move from entry in multiples of initial risk
    pub fn r_multiple(&self, price: Decimal) -> f64 {
        let risk = self.risk_per_unit();
        if risk <= Decimal::ZERO {
            return 0.0;
        }
        ((price - self.entry_price) * self.side.sign() / risk)
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn is_stop_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.stop_price,
            Side::Short => price >= self.stop_price,
        }
    }

    /// Whether `candidate` is strictly tighter than the current stop
    pub fn is_tighter_stop(&self, candidate: Decimal) -> bool {
        match self.side {
            Side::Long => candidate > self.stop_price,
            Side::Short => candidate < self.stop_price,
        }
    }

    /// Refresh pnl_usd / pnl_r at `price`
    pub fn mark(&mut self, price: Decimal) {
        self.pnl_usd = self.realized_pnl + self.unrealized_pnl(price);
        let risk = self.initial_risk_usd();
        self.pnl_r = if risk > Decimal::ZERO {
            (self.pnl_usd / risk).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
    }

    /// Move the stop; refuses to loosen it
    pub fn tighten_stop(&mut self, new_stop: Decimal) -> bool {
        if !self.is_tighter_stop(new_stop) {
            return false;
        }
        self.stop_price = new_stop;
        true
    }

    /// Add to the position at `price`, re-averaging the entry
    pub fn add(&mut self, quantity: Decimal, price: Decimal, fee: Decimal) -> Result<()> {
        if !self.status.is_open() {
            return Err(EngineError::invariant(format!(
                "position {} is closed, cannot add",
                self.id
            )));
        }
        if quantity <= Decimal::ZERO {
            return Ok(());
        }
        let total = self.quantity + quantity;
        self.entry_price = (self.entry_price * self.quantity + price * quantity) / total;
        self.quantity = total;
        self.opened_quantity += quantity;
        self.fees += fee;
        self.realized_pnl -= fee;
        Ok(())
    }

    /// Close `quantity` at `price`. Returns the realized P&L of this close net of fee.
    pub fn reduce(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Decimal> {
        if !self.status.is_open() {
            return Err(EngineError::invariant(format!(
                "position {} already closed",
                self.id
            )));
        }
        if quantity <= Decimal::ZERO || quantity > self.quantity {
            return Err(EngineError::invariant(format!(
                "position {}: close quantity {} outside (0, {}]",
                self.id, quantity, self.quantity
            )));
        }

        let pnl = (price - self.entry_price) * quantity * self.side.sign() - fee;
        self.quantity -= quantity;
        self.closed_quantity += quantity;
        self.realized_pnl += pnl;
        self.fees += fee;

        let next = if self.quantity.is_zero() {
            self.closed_at = Some(at);
            PositionStatus::Closed
        } else {
            PositionStatus::PartiallyClosed
        };
        self.advance_status(next)?;
        self.mark(price);
        Ok(pnl)
    }

    fn advance_status(&mut self, next: PositionStatus) -> Result<()> {
        if next < self.status {
            return Err(EngineError::invariant(format!(
                "position {} status cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// Derived per-position management state, associated to a Position by id only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionTracker {
    pub position_id: PositionId,
    pub tp1_executed: bool,
    pub tp2_executed: bool,
    pub breakeven_moved: bool,
    pub trailing_active: bool,
    pub add_on_executed: bool,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    /// ATR carried from the entry signal, used when candles are too short
    pub entry_atr: Decimal,
}

impl PositionTracker {
    pub fn new(position_id: PositionId, entry_price: Decimal, entry_atr: Decimal) -> Self {
        Self {
            position_id,
            tp1_executed: false,
            tp2_executed: false,
            breakeven_moved: false,
            trailing_active: false,
            add_on_executed: false,
            highest_price: entry_price,
            lowest_price: entry_price,
            entry_atr,
        }
    }

    pub fn observe(&mut self, high: Decimal, low: Decimal) {
        self.highest_price = self.highest_price.max(high);
        self.lowest_price = self.lowest_price.min(low);
    }
}

/// Why a stop moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAdjustment {
    Breakeven,
    Trailing,
}

/// Why a position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TimeExit,
    Emergency,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TimeExit => write!(f, "time_exit"),
            ExitReason::Emergency => write!(f, "emergency"),
            ExitReason::Manual => write!(f, "manual"),
        }
    }
}

/// The dimension an update governs; at most one update per dimension per cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    UpdateStop,
    TakeProfit,
    Close,
    AddOn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum UpdateAction {
    UpdateStop {
        new_stop: Decimal,
        adjustment: StopAdjustment,
    },
    TakeProfit {
        tier: u8,
        quantity: Decimal,
        close_pct: f64,
    },
    Close {
        quantity: Decimal,
        reason: ExitReason,
    },
    AddOn {
        quantity: Decimal,
    },
}

impl UpdateAction {
    pub fn kind(&self) -> UpdateKind {
        match self {
            UpdateAction::UpdateStop { .. } => UpdateKind::UpdateStop,
            UpdateAction::TakeProfit { .. } => UpdateKind::TakeProfit,
            UpdateAction::Close { .. } => UpdateKind::Close,
            UpdateAction::AddOn { .. } => UpdateKind::AddOn,
        }
    }

    /// Whether realizing this update needs a venue order
    pub fn needs_order(&self) -> bool {
        !matches!(self, UpdateAction::UpdateStop { .. })
    }
}

/// Instruction emitted by the position manager for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position_id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub action: UpdateAction,
    /// Mark price the update was derived from
    pub reference_price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long() -> Position {
        Position::open(
            1,
            "SOLUSDT",
            Side::Long,
            StrategyKind::Momentum,
            dec!(10),
            dec!(100),
            dec!(98),
            Decimal::ZERO,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_open_rejects_stop_on_wrong_side() {
        let res = Position::open(
            1,
            "SOLUSDT",
            Side::Short,
            StrategyKind::Momentum,
            dec!(1),
            dec!(100),
            dec!(98),
            Decimal::ZERO,
            Utc::now(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_r_multiple_and_mark() {
        let mut pos = long();
        assert!((pos.r_multiple(dec!(102)) - 1.0).abs() < 1e-9);
        pos.mark(dec!(104));
        assert_eq!(pos.pnl_usd, dec!(40));
        assert!((pos.pnl_r - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_only_tightens() {
        let mut pos = long();
        assert!(pos.tighten_stop(dec!(99)));
        assert!(!pos.tighten_stop(dec!(97)));
        assert_eq!(pos.stop_price, dec!(99));
    }

    #[test]
    fn test_partial_then_full_close_sums_to_opened() {
        let mut pos = long();
        pos.add(dec!(5), dec!(103), Decimal::ZERO).unwrap();
        assert_eq!(pos.entry_price, dec!(101));
        assert_eq!(pos.opened_quantity, dec!(15));

        pos.reduce(dec!(7.5), dec!(104), Decimal::ZERO, Utc::now()).unwrap();
        assert_eq!(pos.status, PositionStatus::PartiallyClosed);
        pos.reduce(dec!(7.5), dec!(102), Decimal::ZERO, Utc::now()).unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.closed_quantity, pos.opened_quantity);
        assert!(pos.closed_at.is_some());

        // Closed is terminal
        assert!(pos.reduce(dec!(1), dec!(100), Decimal::ZERO, Utc::now()).is_err());
        assert!(pos.add(dec!(1), dec!(100), Decimal::ZERO).is_err());
    }

    #[test]
    fn test_reduce_rejects_oversize() {
        let mut pos = long();
        assert!(pos.reduce(dec!(11), dec!(100), Decimal::ZERO, Utc::now()).is_err());
        assert_eq!(pos.quantity, dec!(10));
        assert_eq!(pos.status, PositionStatus::Open);
    }
}
