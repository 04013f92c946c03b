use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::command::TradingMode;
use super::state_machine::StateMachine;
use crate::config::{EngineConfig, TradingPreset};
use crate::domain::{MarketData, PositionSize, ScanResult, Signal};
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionManager;
use crate::position::PositionManager;
use crate::risk::{PositionExposure, RiskManager};
use crate::scanner::MarketScanner;
use crate::signal::SignalGenerator;

/// Everything the engine loop owns between ticks.
///
/// Components are rebuilt or reconfigured from the active preset; the
/// per-cycle caches (`screened`, `pending_signals`, `approved`) carry work
/// from one pipeline stage to the next and are dropped when a cycle aborts.
pub struct EngineContext {
    pub session_id: Option<Uuid>,
    pub preset_name: String,
    pub preset: TradingPreset,
    pub mode: TradingMode,
    pub state: StateMachine,
    pub scanner: MarketScanner,
    pub signals: SignalGenerator,
    pub risk: RiskManager,
    pub execution: Arc<ExecutionManager>,
    pub positions: PositionManager,
    /// Swapped wholesale on refresh
    pub market: Arc<MarketData>,
    pub scan_results: Vec<ScanResult>,
    /// Last known correlation to the reference asset, kept for held symbols
    pub correlations: HashMap<String, f64>,
    pub screened: Vec<ScanResult>,
    pub pending_signals: Vec<Signal>,
    pub approved: Vec<(Signal, PositionSize)>,
    pub recent_signals: VecDeque<Signal>,
    recent_capacity: usize,
    pub equity: Decimal,
    pub last_error: Option<String>,
    /// Set by an internal invariant failure; only start or stop leaves ERROR
    pub requires_reset: bool,
}

impl EngineContext {
    pub fn new(
        engine: &EngineConfig,
        preset_name: String,
        preset: TradingPreset,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            session_id: None,
            mode: TradingMode::Paper,
            state: StateMachine::new(engine.history_capacity),
            scanner: MarketScanner::new(preset.scanner.clone()),
            signals: SignalGenerator::new(&preset.signals),
            risk: RiskManager::new(preset.risk.clone()),
            execution: Arc::new(
                ExecutionManager::new(exchange, preset.execution.clone(), engine.order_book_depth)
                    .with_precision(preset.risk.lot_step, preset.risk.tick_size),
            ),
            positions: PositionManager::new(
                preset.position.clone(),
                preset.risk.lot_step,
                engine.closed_positions_capacity,
            ),
            market: Arc::new(MarketData::default()),
            scan_results: Vec::new(),
            correlations: HashMap::new(),
            screened: Vec::new(),
            pending_signals: Vec::new(),
            approved: Vec::new(),
            recent_signals: VecDeque::new(),
            recent_capacity: engine.recent_signals_capacity.max(1),
            equity: Decimal::ZERO,
            last_error: None,
            requires_reset: false,
            preset_name,
            preset,
        }
    }

    /// Swap in a preset. Open positions, risk counters and the idempotency
    /// ledger survive; strategy memory (pending retests) starts over.
    pub fn apply_preset(&mut self, name: String, preset: TradingPreset) {
        self.scanner = MarketScanner::new(preset.scanner.clone());
        self.signals = SignalGenerator::new(&preset.signals);
        self.risk.reconfigure(preset.risk.clone());
        self.execution = Arc::new(
            self.execution
                .with_config(preset.execution.clone())
                .with_precision(preset.risk.lot_step, preset.risk.tick_size),
        );
        self.positions
            .reconfigure(preset.position.clone(), preset.risk.lot_step);
        info!(preset = %name, "preset applied");
        self.preset_name = name;
        self.preset = preset;
    }

    pub fn swap_market(&mut self, market: MarketData) {
        self.market = Arc::new(market);
    }

    /// Store level-building output and remember each symbol's correlation
    pub fn record_scan(&mut self, results: Vec<ScanResult>) {
        for result in &results {
            if let Some(corr) = result.metrics.correlation {
                self.correlations.insert(result.symbol.clone(), corr);
            }
        }
        self.scan_results = results;
    }

    pub fn correlation_of(&self, symbol: &str) -> Option<f64> {
        self.correlations.get(symbol).copied()
    }

    pub fn exposures(&self) -> Vec<PositionExposure> {
        self.positions.exposures(&self.market, &self.correlations)
    }

    pub fn remember_signal(&mut self, signal: Signal) {
        if self.recent_signals.len() == self.recent_capacity {
            self.recent_signals.pop_front();
        }
        self.recent_signals.push_back(signal);
    }

    /// Drop work carried between stages of an aborted cycle
    pub fn clear_cycle(&mut self) {
        self.screened.clear();
        self.pending_signals.clear();
        self.approved.clear();
    }
}
