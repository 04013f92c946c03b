use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::config::PositionConfig;
use crate::domain::{
    ExitReason, FilledOrder, MarketData, MarketSnapshot, Position, PositionId, PositionTracker,
    PositionUpdate, Side, Signal, StopAdjustment, UpdateAction,
};
use crate::error::{EngineError, Result};
use crate::indicators;
use crate::risk::PositionExposure;

/// Owns open positions and their trackers, and derives management actions.
///
/// Never talks to the venue: it proposes [`PositionUpdate`]s and applies the
/// fills the execution layer reports back.
pub struct PositionManager {
    config: PositionConfig,
    lot_step: Decimal,
    positions: HashMap<PositionId, Position>,
    trackers: HashMap<PositionId, PositionTracker>,
    closed: VecDeque<Position>,
    closed_capacity: usize,
    /// Positions with an update being executed
    in_flight: HashSet<PositionId>,
    next_id: PositionId,
}

impl PositionManager {
    pub fn new(config: PositionConfig, lot_step: Decimal, closed_capacity: usize) -> Self {
        Self {
            config,
            lot_step,
            positions: HashMap::new(),
            trackers: HashMap::new(),
            closed: VecDeque::new(),
            closed_capacity,
            in_flight: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// Swap management rules; open positions and trackers are kept
    pub fn reconfigure(&mut self, config: PositionConfig, lot_step: Decimal) {
        self.config = config;
        self.lot_step = lot_step;
    }

    pub fn get(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn tracker(&self, id: PositionId) -> Option<&PositionTracker> {
        self.trackers.get(&id)
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Position> {
        self.positions.values().find(|p| p.symbol == symbol)
    }

    /// Open positions ordered by id
    pub fn positions(&self) -> Vec<&Position> {
        let mut open: Vec<&Position> = self.positions.values().collect();
        open.sort_by_key(|p| p.id);
        open
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn closed(&self) -> impl Iterator<Item = &Position> {
        self.closed.iter()
    }

    pub fn is_in_flight(&self, id: PositionId) -> bool {
        self.in_flight.contains(&id)
    }

    /// Claim a position for update execution. False if one is already running.
    pub fn begin_update(&mut self, id: PositionId) -> bool {
        self.in_flight.insert(id)
    }

    pub fn finish_update(&mut self, id: PositionId) {
        self.in_flight.remove(&id);
    }

    /// Record a filled entry as a new position
    pub fn open_position(
        &mut self,
        signal: &Signal,
        fill: &FilledOrder,
        now: DateTime<Utc>,
    ) -> Result<PositionId> {
        if let Some(existing) = self.by_symbol(&signal.symbol) {
            return Err(EngineError::invariant(format!(
                "{} already has open position {}",
                signal.symbol, existing.id
            )));
        }
        let id = self.next_id;
        let position = Position::open(
            id,
            &signal.symbol,
            signal.side,
            signal.strategy,
            fill.filled_quantity,
            fill.avg_price,
            signal.stop_price,
            fill.fees,
            now,
        )?;
        self.next_id += 1;

        info!(
            position_id = id,
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            entry = %position.entry_price,
            stop = %position.stop_price,
            "position opened"
        );
        self.trackers
            .insert(id, PositionTracker::new(id, position.entry_price, signal.atr));
        self.positions.insert(id, position);
        Ok(id)
    }

    /// Exposure of every open position at current marks, for the risk monitor
    pub fn exposures(
        &self,
        market: &MarketData,
        correlations: &HashMap<String, f64>,
    ) -> Vec<PositionExposure> {
        self.positions()
            .into_iter()
            .map(|p| {
                let mark = market
                    .get(&p.symbol)
                    .map(|s| s.last_price())
                    .unwrap_or(p.entry_price);
                PositionExposure {
                    symbol: p.symbol.clone(),
                    notional_usd: p.notional(mark),
                    risk_usd: p.quantity * (mark - p.stop_price).abs(),
                    correlation: correlations.get(&p.symbol).copied(),
                }
            })
            .collect()
    }

    /// Unrealized P&L across open positions at current marks
    pub fn unrealized_pnl(&self, market: &MarketData) -> Decimal {
        self.positions
            .values()
            .filter_map(|p| market.get(&p.symbol).map(|s| p.unrealized_pnl(s.last_price())))
            .sum()
    }

    fn round_to_lot(&self, quantity: Decimal) -> Decimal {
        if self.lot_step <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.lot_step).floor() * self.lot_step
    }

    /// Evaluate management rules for every open position not already being
    /// updated. Rule order per position: time exit, stop hit, take profit,
    /// stop adjustment (breakeven then trailing), add-on. A close suppresses
    /// everything else; otherwise at most one update per dimension.
    pub fn process_updates(
        &mut self,
        market: &MarketData,
        now: DateTime<Utc>,
    ) -> Vec<PositionUpdate> {
        let mut ids: Vec<PositionId> = self.positions.keys().copied().collect();
        ids.sort_unstable();

        let mut updates = Vec::new();
        for id in ids {
            if self.in_flight.contains(&id) {
                debug!(position_id = id, "update in flight, skipping");
                continue;
            }
            let Some(position) = self.positions.get(&id) else {
                continue;
            };
            let Some(snapshot) = market.get(&position.symbol) else {
                continue;
            };
            let snapshot = snapshot.clone();
            updates.extend(self.evaluate(id, &snapshot, now));
        }
        updates
    }

    fn evaluate(
        &mut self,
        id: PositionId,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<PositionUpdate> {
        let price = snapshot.last_price();
        let (Some(position), Some(tracker)) =
            (self.positions.get_mut(&id), self.trackers.get_mut(&id))
        else {
            return Vec::new();
        };
        match snapshot.last_candle() {
            Some(candle) => tracker.observe(candle.high.max(price), candle.low.min(price)),
            None => tracker.observe(price, price),
        }
        position.mark(price);

        let position = position.clone();
        let tracker = tracker.clone();
        let update = |action: UpdateAction| PositionUpdate {
            position_id: id,
            symbol: position.symbol.clone(),
            side: position.side,
            action,
            reference_price: price,
            created_at: now,
        };

        // Closes pre-empt every other dimension
        if now - position.opened_at >= Duration::minutes(self.config.max_hold_minutes) {
            info!(position_id = id, symbol = %position.symbol, "max hold time reached");
            return vec![update(UpdateAction::Close {
                quantity: position.quantity,
                reason: ExitReason::TimeExit,
            })];
        }
        if position.is_stop_hit(price) {
            info!(
                position_id = id,
                symbol = %position.symbol,
                %price,
                stop = %position.stop_price,
                "stop hit"
            );
            return vec![update(UpdateAction::Close {
                quantity: position.quantity,
                reason: ExitReason::StopLoss,
            })];
        }

        let mut out = Vec::new();
        let r = position.r_multiple(price);

        let take_profit = self.take_profit(&position, &tracker, r);
        let took_profit = take_profit.is_some();
        if let Some(action) = take_profit {
            out.push(update(action));
        }
        if let Some(action) = self.stop_adjustment(&position, &tracker, snapshot, price) {
            out.push(update(action));
        }
        if !took_profit {
            if let Some(action) = self.add_on(&position, &tracker, snapshot, price, r) {
                out.push(update(action));
            }
        }
        out
    }

    fn take_profit(
        &self,
        position: &Position,
        tracker: &PositionTracker,
        r: f64,
    ) -> Option<UpdateAction> {
        let (tier, close_pct) = if !tracker.tp1_executed && r >= self.config.tp1_r {
            (1, self.config.tp1_close_pct)
        } else if tracker.tp1_executed && !tracker.tp2_executed && r >= self.config.tp2_r {
            (2, self.config.tp2_close_pct)
        } else {
            return None;
        };
        let quantity = self
            .round_to_lot(position.quantity * close_pct)
            .min(position.quantity);
        if quantity <= Decimal::ZERO {
            debug!(position_id = position.id, tier, "take-profit rounds to zero");
            return None;
        }
        info!(position_id = position.id, symbol = %position.symbol, tier, r, "take-profit reached");
        Some(UpdateAction::TakeProfit {
            tier,
            quantity,
            close_pct: close_pct.to_f64().unwrap_or(0.0),
        })
    }

    fn stop_adjustment(
        &self,
        position: &Position,
        tracker: &PositionTracker,
        snapshot: &MarketSnapshot,
        price: Decimal,
    ) -> Option<UpdateAction> {
        if !tracker.tp1_executed {
            return None;
        }
        let (candidate, adjustment) = if !tracker.breakeven_moved {
            let buffer = position.entry_price * self.config.fee_buffer_pct;
            (
                position.entry_price + buffer * position.side.sign(),
                StopAdjustment::Breakeven,
            )
        } else {
            (self.chandelier(position, tracker, snapshot)?, StopAdjustment::Trailing)
        };

        // A stop at or through the market would fire immediately
        let below_market = match position.side {
            Side::Long => candidate < price,
            Side::Short => candidate > price,
        };
        if !position.is_tighter_stop(candidate) || !below_market {
            return None;
        }
        debug!(
            position_id = position.id,
            from = %position.stop_price,
            to = %candidate,
            ?adjustment,
            "stop tightened"
        );
        Some(UpdateAction::UpdateStop {
            new_stop: candidate,
            adjustment,
        })
    }

    /// Highest high minus ATR multiple for longs, lowest low plus it for shorts
    fn chandelier(
        &self,
        position: &Position,
        tracker: &PositionTracker,
        snapshot: &MarketSnapshot,
    ) -> Option<Decimal> {
        let candles = &snapshot.candles;
        let atr = indicators::atr(candles, self.config.atr_period).unwrap_or(tracker.entry_atr);
        if atr <= Decimal::ZERO {
            return None;
        }
        let offset = atr * self.config.trailing_atr_multiple;
        match position.side {
            Side::Long => {
                let high = indicators::highest_high(candles, self.config.trailing_lookback)
                    .unwrap_or(tracker.highest_price);
                Some(high - offset)
            }
            Side::Short => {
                let low = indicators::lowest_low(candles, self.config.trailing_lookback)
                    .unwrap_or(tracker.lowest_price);
                Some(low + offset)
            }
        }
    }

    fn add_on(
        &self,
        position: &Position,
        tracker: &PositionTracker,
        snapshot: &MarketSnapshot,
        price: Decimal,
        r: f64,
    ) -> Option<UpdateAction> {
        if !self.config.add_on_enabled || tracker.add_on_executed || r < self.config.add_on_min_r {
            return None;
        }
        let closes = indicators::closes(&snapshot.candles);
        let ma = indicators::ema(&closes, self.config.add_on_ma_period)?;
        if ma <= Decimal::ZERO {
            return None;
        }
        let distance = ((price - ma) / ma).abs();
        if distance > self.config.add_on_tolerance_pct {
            return None;
        }
        let quantity = self.round_to_lot(position.initial_quantity * self.config.add_on_fraction);
        if quantity <= Decimal::ZERO {
            return None;
        }
        info!(position_id = position.id, symbol = %position.symbol, %quantity, r, "add-on pullback");
        Some(UpdateAction::AddOn { quantity })
    }

    /// Close every open position, e.g. on operator flatten
    pub fn close_all(
        &self,
        market: &MarketData,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Vec<PositionUpdate> {
        self.positions()
            .into_iter()
            .filter(|p| !self.in_flight.contains(&p.id))
            .map(|p| PositionUpdate {
                position_id: p.id,
                symbol: p.symbol.clone(),
                side: p.side,
                action: UpdateAction::Close {
                    quantity: p.quantity,
                    reason,
                },
                reference_price: market
                    .get(&p.symbol)
                    .map(|s| s.last_price())
                    .unwrap_or(p.entry_price),
                created_at: now,
            })
            .collect()
    }

    /// Apply a stop move. Returns false if it would loosen the stop.
    pub fn apply_stop(&mut self, update: &PositionUpdate) -> Result<bool> {
        let UpdateAction::UpdateStop {
            new_stop,
            adjustment,
        } = update.action
        else {
            return Err(EngineError::invariant("apply_stop called with a non-stop update"));
        };
        let (Some(position), Some(tracker)) = (
            self.positions.get_mut(&update.position_id),
            self.trackers.get_mut(&update.position_id),
        ) else {
            return Err(EngineError::invariant(format!(
                "no open position {}",
                update.position_id
            )));
        };
        if !position.tighten_stop(new_stop) {
            warn!(position_id = position.id, %new_stop, "refusing to loosen stop");
            return Ok(false);
        }
        match adjustment {
            StopAdjustment::Breakeven => tracker.breakeven_moved = true,
            StopAdjustment::Trailing => tracker.trailing_active = true,
        }
        info!(
            position_id = position.id,
            symbol = %position.symbol,
            stop = %new_stop,
            ?adjustment,
            "stop updated"
        );
        Ok(true)
    }

    /// Apply an executed update. Returns the position if this fill closed it.
    pub fn apply_fill(
        &mut self,
        update: &PositionUpdate,
        fill: &FilledOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<Position>> {
        if matches!(update.action, UpdateAction::UpdateStop { .. }) {
            self.apply_stop(update)?;
            return Ok(None);
        }
        let id = update.position_id;
        let (Some(position), Some(tracker)) =
            (self.positions.get_mut(&id), self.trackers.get_mut(&id))
        else {
            return Err(EngineError::invariant(format!("no open position {id}")));
        };

        match &update.action {
            UpdateAction::TakeProfit { tier, .. } => {
                let quantity = fill.filled_quantity.min(position.quantity);
                let pnl = position.reduce(quantity, fill.avg_price, fill.fees, now)?;
                match tier {
                    1 => tracker.tp1_executed = true,
                    _ => tracker.tp2_executed = true,
                }
                info!(position_id = id, tier, %quantity, pnl = %pnl.round_dp(2), "take-profit filled");
            }
            UpdateAction::Close { reason, .. } => {
                let quantity = fill.filled_quantity.min(position.quantity);
                let pnl = position.reduce(quantity, fill.avg_price, fill.fees, now)?;
                info!(position_id = id, %reason, %quantity, pnl = %pnl.round_dp(2), "close filled");
            }
            UpdateAction::AddOn { .. } => {
                position.add(fill.filled_quantity, fill.avg_price, fill.fees)?;
                tracker.add_on_executed = true;
                info!(
                    position_id = id,
                    quantity = %fill.filled_quantity,
                    entry = %position.entry_price,
                    "add-on filled"
                );
            }
            UpdateAction::UpdateStop { .. } => {}
        }

        if position.status.is_open() {
            return Ok(None);
        }
        self.trackers.remove(&id);
        let Some(closed) = self.positions.remove(&id) else {
            return Ok(None);
        };
        if closed.closed_quantity != closed.opened_quantity {
            return Err(EngineError::invariant(format!(
                "position {id} closed {} of {} opened",
                closed.closed_quantity, closed.opened_quantity
            )));
        }
        info!(
            position_id = id,
            symbol = %closed.symbol,
            realized = %closed.realized_pnl.round_dp(2),
            r = closed.pnl_r,
            "position closed"
        );
        self.closed.push_back(closed.clone());
        while self.closed.len() > self.closed_capacity {
            self.closed.pop_front();
        }
        Ok(Some(closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStyle, OrderBook, OrderIntent, OrderSide, StrategyKind};
    use crate::indicators::test_support::flat;
    use crate::scanner::test_support::snapshot;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn config() -> PositionConfig {
        PositionConfig {
            add_on_enabled: false,
            ..PositionConfig::default()
        }
    }

    fn signal() -> Signal {
        Signal {
            symbol: "SOLUSDT".into(),
            side: Side::Long,
            strategy: StrategyKind::Momentum,
            entry_price: dec!(100),
            stop_price: dec!(98),
            confidence: 0.7,
            levels: vec![],
            atr: dec!(1),
            created_at: t0(),
        }
    }

    fn fill(intent: OrderIntent, quantity: Decimal, price: Decimal) -> FilledOrder {
        FilledOrder {
            client_order_id: "k".into(),
            symbol: "SOLUSDT".into(),
            side: match intent {
                OrderIntent::Exit => OrderSide::Sell,
                _ => OrderSide::Buy,
            },
            intent,
            style: ExecutionStyle::Single,
            requested_quantity: quantity,
            filled_quantity: quantity,
            avg_price: price,
            fees: Decimal::ZERO,
            child_order_ids: vec![],
            completed_at: t0(),
        }
    }

    /// Market where SOL trades flat at `price`
    fn market(price: Decimal) -> MarketData {
        let snap = snapshot("SOLUSDT", flat(30, price, dec!(0.5), dec!(100)), OrderBook::default());
        MarketData::new(vec![snap], None, t0())
    }

    fn manager_with_long(cfg: PositionConfig) -> (PositionManager, PositionId) {
        let mut pm = PositionManager::new(cfg, dec!(0.001), 10);
        let id = pm
            .open_position(&signal(), &fill(OrderIntent::Entry, dec!(10), dec!(100)), t0())
            .unwrap();
        (pm, id)
    }

    #[test]
    fn test_tp1_then_breakeven() {
        let (mut pm, id) = manager_with_long(config());

        // 1R: take half
        let updates = pm.process_updates(&market(dec!(102)), t0());
        assert_eq!(updates.len(), 1);
        let tp = &updates[0];
        assert_eq!(
            tp.action,
            UpdateAction::TakeProfit {
                tier: 1,
                quantity: dec!(5),
                close_pct: 0.5
            }
        );
        pm.apply_fill(tp, &fill(OrderIntent::Exit, dec!(5), dec!(102)), t0())
            .unwrap();
        assert_eq!(pm.get(id).unwrap().quantity, dec!(5));

        // Next cycle: stop to entry plus fee buffer
        let updates = pm.process_updates(&market(dec!(102)), t0());
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].action,
            UpdateAction::UpdateStop {
                new_stop: dec!(100.1),
                adjustment: StopAdjustment::Breakeven
            }
        );
        assert!(pm.apply_stop(&updates[0]).unwrap());
        assert!(pm.tracker(id).unwrap().breakeven_moved);
        assert_eq!(pm.get(id).unwrap().stop_price, dec!(100.1));
    }

    #[test]
    fn test_tp2_waits_for_tp1() {
        let (mut pm, id) = manager_with_long(config());

        // Already at 2R, but only the first tier is offered
        let updates = pm.process_updates(&market(dec!(104)), t0());
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0].action, UpdateAction::TakeProfit { tier: 1, .. }));
        pm.apply_fill(&updates[0], &fill(OrderIntent::Exit, dec!(5), dec!(104)), t0())
            .unwrap();
        assert!(!pm.tracker(id).unwrap().tp2_executed);

        let updates = pm.process_updates(&market(dec!(104)), t0());
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[0].action,
            UpdateAction::TakeProfit {
                tier: 2,
                quantity: dec!(2.5),
                close_pct: 0.5
            }
        );
        assert_eq!(
            updates[1].action,
            UpdateAction::UpdateStop {
                new_stop: dec!(100.1),
                adjustment: StopAdjustment::Breakeven
            }
        );
    }

    #[test]
    fn test_short_breakeven_and_chandelier() {
        let mut pm = PositionManager::new(config(), dec!(0.001), 10);
        let short = Signal {
            side: Side::Short,
            stop_price: dec!(102),
            ..signal()
        };
        let id = pm
            .open_position(&short, &fill(OrderIntent::Entry, dec!(10), dec!(100)), t0())
            .unwrap();

        // 1R in favor of a short is 98
        let tp = pm.process_updates(&market(dec!(98)), t0()).remove(0);
        assert!(matches!(tp.action, UpdateAction::TakeProfit { tier: 1, .. }));
        pm.apply_fill(&tp, &fill(OrderIntent::Exit, dec!(5), dec!(98)), t0())
            .unwrap();

        // Breakeven sits below entry by the fee buffer
        let updates = pm.process_updates(&market(dec!(98)), t0());
        assert_eq!(
            updates[0].action,
            UpdateAction::UpdateStop {
                new_stop: dec!(99.9),
                adjustment: StopAdjustment::Breakeven
            }
        );
        pm.apply_stop(&updates[0]).unwrap();

        // Flat at 90, range 1: lowest low 89.5 plus 3 ATR
        let updates = pm.process_updates(&market(dec!(90)), t0());
        let trail = updates
            .iter()
            .find(|u| matches!(u.action, UpdateAction::UpdateStop { .. }))
            .unwrap();
        assert_eq!(
            trail.action,
            UpdateAction::UpdateStop {
                new_stop: dec!(92.5),
                adjustment: StopAdjustment::Trailing
            }
        );
        pm.apply_stop(trail).unwrap();
        assert_eq!(pm.get(id).unwrap().stop_price, dec!(92.5));

        // A bounce through the trail closes the rest
        let updates = pm.process_updates(&market(dec!(93)), t0());
        assert_eq!(
            updates[0].action,
            UpdateAction::Close {
                quantity: dec!(5),
                reason: ExitReason::StopLoss
            }
        );
    }

    #[test]
    fn test_stop_hit_closes_and_suppresses_others() {
        let (mut pm, id) = manager_with_long(config());
        let updates = pm.process_updates(&market(dec!(97.5)), t0());
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].action,
            UpdateAction::Close {
                quantity: dec!(10),
                reason: ExitReason::StopLoss
            }
        );
        let closed = pm
            .apply_fill(&updates[0], &fill(OrderIntent::Exit, dec!(10), dec!(97.5)), t0())
            .unwrap()
            .unwrap();
        assert_eq!(closed.id, id);
        assert_eq!(closed.realized_pnl, dec!(-25));
        assert_eq!(pm.open_count(), 0);
        assert_eq!(pm.closed().count(), 1);
    }

    #[test]
    fn test_time_exit() {
        let (mut pm, _) = manager_with_long(config());
        let later = t0() + Duration::minutes(24 * 60);
        let updates = pm.process_updates(&market(dec!(101)), later);
        assert!(matches!(
            updates[0].action,
            UpdateAction::Close {
                reason: ExitReason::TimeExit,
                ..
            }
        ));
    }

    #[test]
    fn test_trailing_never_loosens() {
        let (mut pm, id) = manager_with_long(config());
        let tp = pm.process_updates(&market(dec!(102)), t0()).remove(0);
        pm.apply_fill(&tp, &fill(OrderIntent::Exit, dec!(5), dec!(102)), t0())
            .unwrap();
        let be = pm.process_updates(&market(dec!(102)), t0()).remove(0);
        pm.apply_stop(&be).unwrap();

        // Flat at 110, range 1: ATR 1, highest high 110.5, trail = 107.5
        let updates = pm.process_updates(&market(dec!(110)), t0());
        let trail = updates
            .iter()
            .find(|u| matches!(u.action, UpdateAction::UpdateStop { .. }))
            .unwrap();
        assert_eq!(
            trail.action,
            UpdateAction::UpdateStop {
                new_stop: dec!(107.5),
                adjustment: StopAdjustment::Trailing
            }
        );
        pm.apply_stop(trail).unwrap();

        // Price eases back: the lower chandelier is not proposed
        let updates = pm.process_updates(&market(dec!(109)), t0());
        assert!(updates
            .iter()
            .all(|u| !matches!(u.action, UpdateAction::UpdateStop { .. })));

        // And a manual loosening is refused
        let loosen = PositionUpdate {
            action: UpdateAction::UpdateStop {
                new_stop: dec!(105),
                adjustment: StopAdjustment::Trailing,
            },
            ..trail.clone()
        };
        assert!(!pm.apply_stop(&loosen).unwrap());
        assert_eq!(pm.get(id).unwrap().stop_price, dec!(107.5));
    }

    #[test]
    fn test_add_on_once_and_quantities_reconcile() {
        let mut cfg = config();
        cfg.add_on_enabled = true;
        let (mut pm, id) = manager_with_long(cfg);

        // Flat at 101.2: 0.6R, price sits on its EMA
        let updates = pm.process_updates(&market(dec!(101.2)), t0());
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].action, UpdateAction::AddOn { quantity: dec!(5) });
        pm.apply_fill(&updates[0], &fill(OrderIntent::AddOn, dec!(5), dec!(101.2)), t0())
            .unwrap();
        assert!(pm.tracker(id).unwrap().add_on_executed);
        assert_eq!(pm.get(id).unwrap().opened_quantity, dec!(15));

        // No second add-on
        let updates = pm.process_updates(&market(dec!(101.2)), t0());
        assert!(updates.is_empty());

        // Partial then full close reconciles against entry plus add-on
        let tp = PositionUpdate {
            action: UpdateAction::TakeProfit {
                tier: 1,
                quantity: dec!(7.5),
                close_pct: 0.5,
            },
            ..updates_template(id)
        };
        pm.apply_fill(&tp, &fill(OrderIntent::Exit, dec!(7.5), dec!(103)), t0())
            .unwrap();
        let close = PositionUpdate {
            action: UpdateAction::Close {
                quantity: dec!(7.5),
                reason: ExitReason::Manual,
            },
            ..updates_template(id)
        };
        let closed = pm
            .apply_fill(&close, &fill(OrderIntent::Exit, dec!(7.5), dec!(103)), t0())
            .unwrap()
            .unwrap();
        assert_eq!(closed.closed_quantity, closed.opened_quantity);
        assert_eq!(closed.closed_quantity, dec!(15));
    }

    fn updates_template(id: PositionId) -> PositionUpdate {
        PositionUpdate {
            position_id: id,
            symbol: "SOLUSDT".into(),
            side: Side::Long,
            action: UpdateAction::AddOn {
                quantity: Decimal::ZERO,
            },
            reference_price: dec!(103),
            created_at: t0(),
        }
    }

    #[test]
    fn test_duplicate_symbol_is_invariant() {
        let (mut pm, _) = manager_with_long(config());
        let err = pm
            .open_position(&signal(), &fill(OrderIntent::Entry, dec!(1), dec!(100)), t0())
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[test]
    fn test_in_flight_position_is_skipped() {
        let (mut pm, id) = manager_with_long(config());
        assert!(pm.begin_update(id));
        assert!(!pm.begin_update(id));
        assert!(pm.process_updates(&market(dec!(97)), t0()).is_empty());
        pm.finish_update(id);
        assert_eq!(pm.process_updates(&market(dec!(97)), t0()).len(), 1);
    }

    #[test]
    fn test_exposures_use_current_stop_distance() {
        let (pm, _) = manager_with_long(config());
        let mut corr = HashMap::new();
        corr.insert("SOLUSDT".to_string(), 0.7);
        let exposures = pm.exposures(&market(dec!(101)), &corr);
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0].notional_usd, dec!(1010));
        assert_eq!(exposures[0].risk_usd, dec!(30));
        assert_eq!(exposures[0].correlation, Some(0.7));
    }
}
