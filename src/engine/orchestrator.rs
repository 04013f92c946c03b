//! Engine orchestrator: advances the trading pipeline one stage per tick.
//!
//! `run()`:
//! - ticks the state machine on a fixed interval
//! - applies operator commands between ticks
//! - publishes a snapshot after every tick and command
//! - stops the pipeline and cancels working entries on shutdown
//!
//! A healthy cycle is SCANNING → LEVEL_BUILDING → SIGNAL_WAIT → SIZING →
//! EXECUTION → MANAGING → SCANNING. Stages with nothing to do skip ahead to
//! MANAGING so open positions are looked after every cycle. PAUSED,
//! EMERGENCY and an ERROR awaiting reset keep managing positions in place.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{EngineCommand, EngineEvent, EngineHandle, EngineSnapshot, TradingMode};
use super::context::EngineContext;
use crate::config::AppConfig;
use crate::domain::{
    FilledOrder, MarketData, OrderBook, OrderIntent, Position, PositionId, PositionUpdate,
    ScanResult, Signal, TradingState, UpdateAction,
};
use crate::error::{EngineError, ErrorClass, Result};
use crate::exchange::{ExchangeClient, MarketDataProvider};
use crate::execution::RateCategory;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

type UpdateOutcome = (PositionUpdate, Result<Option<FilledOrder>>);

/// Errors that leave the current stage instead of being logged and skipped
fn escalates(err: &EngineError) -> bool {
    matches!(
        err.class(),
        ErrorClass::FatalExchange | ErrorClass::InternalInvariant
    ) || matches!(err, EngineError::RetriesExhausted { .. })
}

/// Parent idempotency key for an entry
fn entry_key(session: Option<Uuid>, signal: &Signal) -> String {
    format!(
        "entry-{}-{}-{}-{}",
        session.map(|s| s.simple().to_string()).unwrap_or_default(),
        signal.symbol,
        signal.strategy,
        signal.created_at.timestamp_millis()
    )
}

pub struct Orchestrator {
    config: AppConfig,
    ctx: EngineContext,
    exchange: Arc<dyn ExchangeClient>,
    market_data: Arc<dyn MarketDataProvider>,
    commands_tx: mpsc::Sender<EngineCommand>,
    commands_rx: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshot: Arc<RwLock<EngineSnapshot>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        exchange: Arc<dyn ExchangeClient>,
        market_data: Arc<dyn MarketDataProvider>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| EngineError::validation(errors.join("; ")))?;
        let preset_name = config.engine.default_preset.clone();
        let preset = config.preset(&preset_name)?;
        let ctx = EngineContext::new(&config.engine, preset_name, preset, Arc::clone(&exchange));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(config.engine.event_channel_capacity.max(1));

        Ok(Self {
            config,
            ctx,
            exchange,
            market_data,
            commands_tx,
            commands_rx,
            events,
            snapshot: Arc::new(RwLock::new(EngineSnapshot::default())),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(
            self.commands_tx.clone(),
            self.events.clone(),
            Arc::clone(&self.snapshot),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TradingState {
        self.ctx.state.current()
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Run until `shutdown_rx` fires
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_millis(self.config.engine.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            preset = %self.ctx.preset_name,
            tick_ms = self.config.engine.tick_interval_ms,
            "engine loop started"
        );
        self.publish().await;

        loop {
            tokio::select! {
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("engine loop shutting down");
                    if let Err(e) = self.stop().await {
                        warn!(error = %e, "stop during shutdown failed");
                    }
                    self.publish().await;
                    break;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        debug!(?command, "engine command");
        let (reply, result) = match command {
            EngineCommand::Start {
                preset,
                mode,
                reply,
            } => (reply, self.start(preset, mode).await),
            EngineCommand::Stop { reply } => (reply, self.stop().await),
            EngineCommand::Pause { reply } => (reply, self.pause()),
            EngineCommand::Resume { reply } => (reply, self.resume()),
            EngineCommand::EmergencyStop { reason, reply } => {
                (reply, self.emergency_stop(reason).await)
            }
            EngineCommand::Reload { preset, reply } => (reply, self.reload(preset)),
        };
        self.publish().await;
        if reply.send(result).is_err() {
            debug!("command caller went away before the reply");
        }
    }

    // ---- commands ----

    /// Load a preset and move IDLE → INITIALIZING → SCANNING. Also restarts
    /// from STOPPED or ERROR; a restart clears the kill switch.
    pub async fn start(&mut self, preset: Option<String>, mode: TradingMode) -> Result<()> {
        if mode == TradingMode::Live && self.exchange.name() == "paper" {
            return Err(EngineError::validation(
                "live mode needs a live venue client, got the paper venue",
            ));
        }
        let name = preset.unwrap_or_else(|| self.ctx.preset_name.clone());
        let preset = self.config.preset(&name)?;

        match self.state() {
            TradingState::Idle | TradingState::Error => {}
            TradingState::Stopped => self.transition(TradingState::Idle, "reset for restart")?,
            other => {
                return Err(EngineError::validation(format!(
                    "cannot start while {other}"
                )))
            }
        }

        self.ctx.apply_preset(name.clone(), preset);
        self.ctx.mode = mode;
        self.ctx.session_id = Some(Uuid::new_v4());
        self.ctx.requires_reset = false;
        self.ctx.last_error = None;
        self.ctx.clear_cycle();
        self.ctx.risk.monitor_mut().reset_kill_switch();
        self.ctx.risk.resume();
        self.ctx.execution.unblock_entries();

        self.transition(
            TradingState::Initializing,
            format!("start preset={name} mode={mode}"),
        )?;
        if let Err(e) = self.initialize().await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Fetch balance, reconcile venue positions, seed the risk window
    async fn initialize(&mut self) -> Result<()> {
        let now = Utc::now();
        let execution = Arc::clone(&self.ctx.execution);
        let exchange = Arc::clone(&self.exchange);

        let venue_positions = execution
            .call(RateCategory::Account, "fetch_positions", || {
                exchange.fetch_positions()
            })
            .await?;
        for venue in &venue_positions {
            if self.ctx.positions.by_symbol(&venue.symbol).is_none() {
                warn!(
                    symbol = %venue.symbol,
                    quantity = %venue.quantity,
                    "venue position is not tracked by the engine"
                );
            }
        }

        if let Some(reason) = self.refresh_risk(now).await? {
            return self.enter_emergency(reason).await;
        }
        info!(
            session = ?self.ctx.session_id,
            equity = %self.ctx.equity,
            open = self.ctx.positions.open_count(),
            "engine initialized"
        );
        self.transition(TradingState::Scanning, "initialized")
    }

    /// Stop the pipeline. Open positions stay on the venue.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state() == TradingState::Stopped {
            return Ok(());
        }
        self.ctx.execution.block_entries("engine stopped");
        let cancelled = self.ctx.execution.cancel_in_flight_entries().await;
        self.ctx.clear_cycle();
        self.transition_with(
            TradingState::Stopped,
            "operator stop",
            &[("cancelled_entries", cancelled.to_string())],
        )?;
        let open = self.ctx.positions.open_count();
        if open > 0 {
            warn!(open, "stopped with open positions");
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state() == TradingState::Idle {
            return Err(EngineError::validation("cannot pause before start"));
        }
        if !self.ctx.state.can_transition_to(TradingState::Paused) {
            return Err(EngineError::validation(format!(
                "cannot pause while {}",
                self.state()
            )));
        }
        self.ctx.risk.halt("operator pause");
        self.ctx.execution.block_entries("operator pause");
        self.ctx.clear_cycle();
        self.transition(TradingState::Paused, "operator pause")
    }

    /// PAUSED → SCANNING. A latched kill switch or a pending reset keeps
    /// the engine paused; those need stop and start.
    pub fn resume(&mut self) -> Result<()> {
        if self.state() != TradingState::Paused {
            return Err(EngineError::validation(format!(
                "cannot resume while {}",
                self.state()
            )));
        }
        if self.ctx.risk.monitor().is_kill_switch_active() {
            return Err(EngineError::validation(
                "kill switch is latched, stop and start to clear it",
            ));
        }
        if self.ctx.requires_reset {
            return Err(EngineError::validation("reset required, stop and start"));
        }
        self.ctx.risk.resume();
        self.ctx.execution.unblock_entries();
        self.transition(TradingState::Scanning, "operator resume")
    }

    pub async fn emergency_stop(&mut self, reason: String) -> Result<()> {
        match self.state() {
            TradingState::Emergency => Ok(()),
            state if state.can_transition_to(TradingState::Emergency) => {
                self.enter_emergency(format!("operator emergency stop: {reason}"))
                    .await
            }
            state => Err(EngineError::validation(format!(
                "cannot enter emergency while {state}"
            ))),
        }
    }

    /// Swap the active preset in place
    pub fn reload(&mut self, preset: String) -> Result<()> {
        let loaded = self.config.preset(&preset)?;
        self.ctx.apply_preset(preset, loaded);
        Ok(())
    }

    // ---- pipeline ----

    /// Run the current stage once
    pub async fn tick(&mut self) {
        let now = Utc::now();
        let result = match self.state() {
            TradingState::Scanning => self.scan(now).await,
            TradingState::LevelBuilding => self.build_levels(),
            TradingState::SignalWait => self.wait_for_signals(now).await,
            TradingState::Sizing => self.size_signals(),
            TradingState::Execution => self.execute_entries(now).await,
            TradingState::Managing => match self.manage(now).await {
                Ok(()) => self.transition(TradingState::Scanning, "cycle complete"),
                Err(e) => Err(e),
            },
            TradingState::Paused | TradingState::Emergency => self.manage_in_place(now).await,
            TradingState::Error => self.recover(now).await,
            TradingState::Idle | TradingState::Initializing | TradingState::Stopped => Ok(()),
        };
        if let Err(e) = result {
            self.fail(&e).await;
        }
        self.publish().await;
    }

    async fn scan(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ctx.clear_cycle();
        let symbols = self.ctx.scanner.requested_symbols();
        let market = match self.fetch_market(symbols, now).await {
            Ok(market) => market,
            Err(EngineError::DeadlineExceeded(ms)) => {
                warn!(deadline_ms = ms, "market refresh missed the deadline, discarding");
                return self.transition(TradingState::Managing, "scan deadline exceeded");
            }
            Err(e) => return Err(e),
        };
        self.ctx.swap_market(market);

        if let Some(reason) = self.refresh_risk(now).await? {
            return self.enter_emergency(reason).await;
        }
        if !self.ctx.risk.entries_allowed() {
            return self.transition(TradingState::Managing, "entries not allowed");
        }

        let watched = self.ctx.signals.watched_symbols();
        let screened = self.ctx.scanner.screen_watching(&self.ctx.market, now, &watched);
        let passed = screened.iter().filter(|r| r.passed).count();
        debug!(scanned = screened.len(), passed, "universe screened");
        self.ctx.screened = screened;
        self.transition(
            TradingState::LevelBuilding,
            format!("{passed} symbols passed screening"),
        )
    }

    fn build_levels(&mut self) -> Result<()> {
        let screened = std::mem::take(&mut self.ctx.screened);
        let results = self.ctx.scanner.build_levels(screened, &self.ctx.market);
        self.ctx.record_scan(results);
        let candidates = self.ctx.scanner.candidates(&self.ctx.scan_results).len();
        self.transition(
            TradingState::SignalWait,
            format!("{candidates} candidates"),
        )
    }

    async fn wait_for_signals(&mut self, now: DateTime<Utc>) -> Result<()> {
        let candidates: Vec<ScanResult> = self
            .ctx
            .scanner
            .candidates(&self.ctx.scan_results)
            .into_iter()
            .cloned()
            .collect();
        if candidates.is_empty() {
            return self.transition(TradingState::Managing, "no candidates");
        }

        let symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();
        let books = match self.refresh_books(&symbols).await {
            Ok(books) => books,
            Err(EngineError::DeadlineExceeded(ms)) => {
                warn!(deadline_ms = ms, "book refresh missed the deadline, discarding");
                return self.transition(TradingState::Managing, "signal deadline exceeded");
            }
            Err(e) => return Err(e),
        };
        if !books.is_empty() {
            let mut market = self.ctx.market.as_ref().clone();
            for (symbol, book) in books {
                market = market.with_order_book(&symbol, book);
            }
            self.ctx.swap_market(market);
        }

        let signals = self.ctx.signals.generate(&candidates, &self.ctx.market, now);
        if signals.is_empty() {
            return self.transition(TradingState::Managing, "no signals");
        }
        for signal in &signals {
            info!(
                symbol = %signal.symbol,
                side = %signal.side,
                strategy = %signal.strategy,
                entry = %signal.entry_price,
                stop = %signal.stop_price,
                confidence = signal.confidence,
                "signal"
            );
            self.ctx.remember_signal(signal.clone());
            self.emit(EngineEvent::SignalEmitted(signal.clone()));
        }
        let count = signals.len();
        self.ctx.pending_signals = signals;
        self.transition(TradingState::Sizing, format!("{count} signals"))
    }

    fn size_signals(&mut self) -> Result<()> {
        let signals = std::mem::take(&mut self.ctx.pending_signals);
        if !self.ctx.risk.entries_allowed() {
            return self.transition(TradingState::Managing, "entries not allowed");
        }

        let mut approved = Vec::new();
        for signal in signals {
            let Some(snapshot) = self.ctx.market.get(&signal.symbol).cloned() else {
                continue;
            };
            let correlation = self.ctx.correlation_of(&signal.symbol);
            if let Ok(size) =
                self.ctx
                    .risk
                    .approve(&signal, correlation, self.ctx.equity, &snapshot.order_book)
            {
                approved.push((signal, size));
            }
        }

        if approved.is_empty() {
            return self.transition(TradingState::Managing, "no signals approved");
        }
        let count = approved.len();
        self.ctx.approved = approved;
        self.transition(TradingState::Execution, format!("{count} entries approved"))
    }

    async fn execute_entries(&mut self, now: DateTime<Utc>) -> Result<()> {
        let approved = std::mem::take(&mut self.ctx.approved);
        let execution = Arc::clone(&self.ctx.execution);
        let session = self.ctx.session_id;
        let submitted = approved.len();

        // Entries finished before the deadline are kept; the rest are dropped
        // and their resting children cancelled
        let results: Vec<(Signal, Result<FilledOrder>)> = stream::iter(approved)
            .map(|(signal, size)| {
                let execution = Arc::clone(&execution);
                let key = entry_key(session, &signal);
                async move {
                    let fill = execution
                        .execute_trade(&size, OrderIntent::Entry, &key)
                        .await;
                    (signal, fill)
                }
            })
            .buffer_unordered(self.pool_size())
            .take_until(sleep_until(self.stage_deadline()))
            .collect()
            .await;
        let expired = results.len() < submitted;
        if expired {
            let cancelled = execution.cancel_in_flight_entries().await;
            warn!(
                deadline_ms = self.config.engine.cycle_deadline_ms,
                finished = results.len(),
                submitted,
                cancelled,
                "entry fan-out missed the deadline"
            );
        }

        let mut opened = 0usize;
        let mut escalated: Option<EngineError> = None;
        for (signal, fill) in results {
            match fill {
                Ok(fill) => match self.ctx.positions.open_position(&signal, &fill, now) {
                    Ok(id) => {
                        opened += 1;
                        self.emit_position(id, None);
                    }
                    Err(e) => {
                        error!(symbol = %signal.symbol, error = %e, "could not record entry fill");
                        escalated = escalated.or(Some(e));
                    }
                },
                Err(e) if escalates(&e) => {
                    error!(symbol = %signal.symbol, error = %e, "entry failed");
                    escalated = escalated.or(Some(e));
                }
                Err(e) => {
                    warn!(symbol = %signal.symbol, class = %e.class(), error = %e, "entry skipped");
                }
            }
        }

        if let Some(e) = escalated {
            return Err(e);
        }
        if expired {
            return self.transition(
                TradingState::Managing,
                format!("entry deadline exceeded, {opened} entries filled"),
            );
        }
        self.transition(TradingState::Managing, format!("{opened} entries filled"))
    }

    /// Evaluate and realize position updates. Stop moves apply directly;
    /// orders run concurrently across positions and in order within one.
    async fn manage(&mut self, now: DateTime<Utc>) -> Result<()> {
        let updates = self.ctx.positions.process_updates(&self.ctx.market, now);
        if updates.is_empty() {
            return Ok(());
        }

        let block_adds = self.ctx.execution.entries_blocked()
            || !self.ctx.risk.entries_allowed()
            || !self.state().is_pipeline_stage();
        let mut orders: BTreeMap<PositionId, Vec<PositionUpdate>> = BTreeMap::new();
        for update in updates {
            match update.action {
                UpdateAction::UpdateStop { .. } => {
                    if self.ctx.positions.apply_stop(&update)? {
                        self.emit_position(update.position_id, Some(update));
                    }
                }
                UpdateAction::AddOn { .. } if block_adds => {
                    debug!(position_id = update.position_id, "add-on skipped, entries blocked");
                }
                _ => orders.entry(update.position_id).or_default().push(update),
            }
        }
        if orders.is_empty() {
            return Ok(());
        }

        let mut batches: Vec<(Position, Vec<PositionUpdate>)> = Vec::new();
        for (id, updates) in orders {
            let Some(position) = self.ctx.positions.get(id).cloned() else {
                continue;
            };
            if self.ctx.positions.begin_update(id) {
                batches.push((position, updates));
            }
        }

        // Exits are not bound by the stage deadline; each call keeps its order timeout
        let execution = Arc::clone(&self.ctx.execution);
        let results: Vec<(PositionId, Vec<UpdateOutcome>)> = stream::iter(batches)
            .map(|(position, updates)| {
                let execution = Arc::clone(&execution);
                async move {
                    let mut outcomes = Vec::with_capacity(updates.len());
                    for update in updates {
                        let outcome = execution.execute_update(&position, &update).await;
                        let failed = outcome.is_err();
                        outcomes.push((update, outcome));
                        if failed {
                            break;
                        }
                    }
                    (position.id, outcomes)
                }
            })
            .buffer_unordered(self.pool_size())
            .collect()
            .await;

        let mut escalated: Option<EngineError> = None;
        for (id, outcomes) in results {
            for (update, outcome) in outcomes {
                match outcome {
                    Ok(Some(fill)) => match self.ctx.positions.apply_fill(&update, &fill, now) {
                        Ok(Some(closed)) => {
                            self.ctx
                                .risk
                                .monitor_mut()
                                .record_trade_result(closed.realized_pnl);
                            self.emit(EngineEvent::PositionUpdated {
                                position: closed,
                                update: Some(update),
                            });
                        }
                        Ok(None) => self.emit_position(id, Some(update)),
                        Err(e) => {
                            error!(position_id = id, error = %e, "could not apply fill");
                            escalated = escalated.or(Some(e));
                        }
                    },
                    Ok(None) => {}
                    Err(e) if escalates(&e) => {
                        error!(position_id = id, error = %e, "position update failed");
                        escalated = escalated.or(Some(e));
                    }
                    Err(e) => {
                        warn!(position_id = id, class = %e.class(), error = %e, "position update skipped");
                    }
                }
            }
            self.ctx.positions.finish_update(id);
        }

        match escalated {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// PAUSED, EMERGENCY and ERROR awaiting reset: refresh held symbols and
    /// manage exits without advancing the pipeline
    async fn manage_in_place(&mut self, now: DateTime<Utc>) -> Result<()> {
        let held: Vec<String> = self
            .ctx
            .positions
            .positions()
            .into_iter()
            .map(|p| p.symbol.clone())
            .collect();
        if held.is_empty() {
            return Ok(());
        }

        match self.fetch_market(held, now).await {
            Ok(market) => self.ctx.swap_market(market),
            Err(EngineError::DeadlineExceeded(ms)) => {
                warn!(deadline_ms = ms, "position refresh missed the deadline");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if self.state() == TradingState::Paused {
            if let Some(reason) = self.refresh_risk(now).await? {
                return self.enter_emergency(reason).await;
            }
        }
        self.manage(now).await
    }

    async fn recover(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.ctx.requires_reset {
            return self.manage_in_place(now).await;
        }
        self.transition(TradingState::Scanning, "auto-recovery")
    }

    // ---- failure handling ----

    async fn fail(&mut self, err: &EngineError) {
        let class = err.class();
        self.ctx.last_error = Some(err.to_string());
        self.ctx.clear_cycle();

        let state = self.state();
        if matches!(
            state,
            TradingState::Emergency | TradingState::Stopped | TradingState::Idle
        ) {
            error!(%state, %class, error = %err, "error outside the pipeline");
            return;
        }

        let result = match class {
            ErrorClass::FatalExchange => {
                error!(%state, error = %err, "fatal venue error");
                self.enter_emergency(format!("fatal venue error: {err}")).await
            }
            ErrorClass::InternalInvariant => {
                error!(%state, error = %err, "invariant violated, reset required");
                self.ctx.requires_reset = true;
                self.transition_if_needed(TradingState::Error, err, class)
            }
            _ => {
                warn!(%state, %class, error = %err, "stage failed");
                self.transition_if_needed(TradingState::Error, err, class)
            }
        };
        if let Err(e) = result {
            error!(error = %e, "could not record failure transition");
        }
    }

    fn transition_if_needed(
        &mut self,
        to: TradingState,
        err: &EngineError,
        class: ErrorClass,
    ) -> Result<()> {
        if self.state() == to {
            return Ok(());
        }
        self.transition_with(to, err.to_string(), &[("class", class.to_string())])
    }

    /// Latch the kill switch, block and cancel entries, switch to exits only
    async fn enter_emergency(&mut self, reason: String) -> Result<()> {
        if self.state() == TradingState::Emergency {
            return Ok(());
        }
        if !self.ctx.risk.monitor().is_kill_switch_active() {
            self.ctx.risk.monitor_mut().trip_kill_switch(reason.clone());
        }
        self.ctx.risk.halt(reason.clone());
        self.ctx.execution.block_entries(&reason);
        let cancelled = self.ctx.execution.cancel_in_flight_entries().await;
        self.ctx.clear_cycle();

        let daily_pnl = format!("{:.2}", self.ctx.risk.metrics().daily_pnl_pct);
        self.transition_with(
            TradingState::Emergency,
            reason.clone(),
            &[
                ("cancelled_entries", cancelled.to_string()),
                ("daily_pnl_pct", daily_pnl),
            ],
        )?;
        error!(%reason, cancelled, "kill switch engaged");
        self.emit(EngineEvent::KillSwitch { reason });
        Ok(())
    }

    // ---- venue fan-out ----

    fn pool_size(&self) -> usize {
        self.config.engine.worker_pool_size.max(1)
    }

    fn stage_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.engine.cycle_deadline_ms)
    }

    /// Fetch snapshots in chunks on the bounded pool. Partial chunk
    /// failures are tolerated; all chunks failing is an error.
    async fn fetch_market(&self, symbols: Vec<String>, now: DateTime<Utc>) -> Result<MarketData> {
        let chunk_size = self.config.engine.snapshot_chunk_size.max(1);
        let chunks: Vec<Vec<String>> = symbols.chunks(chunk_size).map(<[String]>::to_vec).collect();
        let total = chunks.len();
        let provider = Arc::clone(&self.market_data);
        let execution = Arc::clone(&self.ctx.execution);

        let fetches = stream::iter(chunks)
            .map(|chunk| {
                let provider = Arc::clone(&provider);
                let execution = Arc::clone(&execution);
                async move {
                    execution
                        .call(RateCategory::MarketData, "get_snapshot", || {
                            provider.get_snapshot(&chunk)
                        })
                        .await
                }
            })
            .buffer_unordered(self.pool_size())
            .collect::<Vec<_>>();
        let results = timeout_at(self.stage_deadline(), fetches)
            .await
            .map_err(|_| EngineError::DeadlineExceeded(self.config.engine.cycle_deadline_ms))?;

        let mut snapshots = Vec::new();
        let mut first_error = None;
        let mut failed = 0usize;
        for result in results {
            match result {
                Ok(batch) => snapshots.extend(batch),
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "snapshot chunk failed");
                    first_error = first_error.or(Some(e));
                }
            }
        }
        if failed > 0 && failed == total {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        debug!(symbols = snapshots.len(), chunks = total, failed, "market refreshed");

        let reference = self.ctx.scanner.config().reference_symbol.clone();
        Ok(MarketData::new(snapshots, reference, now))
    }

    /// Fresh books for signal evaluation. A failed symbol keeps its
    /// snapshot book.
    async fn refresh_books(&self, symbols: &[String]) -> Result<Vec<(String, OrderBook)>> {
        let execution = Arc::clone(&self.ctx.execution);
        let fetches = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let execution = Arc::clone(&execution);
                async move {
                    let book = execution.fetch_order_book(&symbol).await;
                    (symbol, book)
                }
            })
            .buffer_unordered(self.pool_size())
            .collect::<Vec<_>>();
        let results = timeout_at(self.stage_deadline(), fetches)
            .await
            .map_err(|_| EngineError::DeadlineExceeded(self.config.engine.cycle_deadline_ms))?;

        Ok(results
            .into_iter()
            .filter_map(|(symbol, book)| match book {
                Ok(book) => Some((symbol, book)),
                Err(e) => {
                    warn!(%symbol, error = %e, "order book refresh failed");
                    None
                }
            })
            .collect())
    }

    /// Fetch equity and recompute risk metrics. Returns the kill-switch
    /// reason if it tripped on this refresh.
    async fn refresh_risk(&mut self, now: DateTime<Utc>) -> Result<Option<String>> {
        let exchange = Arc::clone(&self.exchange);
        let balance = self
            .ctx
            .execution
            .call(RateCategory::Account, "fetch_balance", || exchange.fetch_balance())
            .await?;
        self.ctx.equity = balance.total_equity;

        let exposures = self.ctx.exposures();
        let tripped = self
            .ctx
            .risk
            .monitor_mut()
            .refresh(balance.total_equity, &exposures, now);
        Ok(tripped.map(|e| e.to_string()))
    }

    // ---- state and events ----

    fn transition(&mut self, to: TradingState, reason: impl Into<String>) -> Result<()> {
        let record = self.ctx.state.transition(to, reason)?;
        self.emit(EngineEvent::StateChanged(record));
        Ok(())
    }

    fn transition_with(
        &mut self,
        to: TradingState,
        reason: impl Into<String>,
        metadata: &[(&str, String)],
    ) -> Result<()> {
        let record = self.ctx.state.transition_with(to, reason, metadata)?;
        self.emit(EngineEvent::StateChanged(record));
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_position(&self, id: PositionId, update: Option<PositionUpdate>) {
        if let Some(position) = self.ctx.positions.get(id) {
            self.emit(EngineEvent::PositionUpdated {
                position: position.clone(),
                update,
            });
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let ctx = &self.ctx;
        EngineSnapshot {
            session_id: ctx.session_id.map(|s| s.to_string()),
            state: ctx.state.current(),
            previous_state: ctx.state.previous(),
            valid_next_states: ctx.state.valid_next_states().to_vec(),
            last_reason: ctx.state.last_transition().map(|t| t.reason.clone()),
            last_error: ctx.last_error.clone(),
            requires_reset: ctx.requires_reset,
            preset: ctx.preset_name.clone(),
            mode: ctx.mode,
            equity: ctx.equity,
            entries_blocked: ctx.execution.entries_blocked(),
            open_positions: ctx.positions.positions().into_iter().cloned().collect(),
            closed_positions: ctx.positions.closed().cloned().collect(),
            recent_signals: ctx.recent_signals.iter().cloned().collect(),
            scan_results: ctx.scan_results.clone(),
            risk: ctx.risk.metrics().clone(),
            history: ctx.state.history().cloned().collect(),
            transition_count: ctx.state.transition_count(),
            updated_at: Utc::now(),
        }
    }

    async fn publish(&self) {
        let snapshot = self.snapshot();
        *self.snapshot.write().await = snapshot;
    }

    /// Unrealized P&L of open positions at the current marks
    pub fn unrealized_pnl(&self) -> Decimal {
        self.ctx.positions.unrealized_pnl(&self.ctx.market)
    }
}
