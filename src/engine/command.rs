//! Engine commands, events and the read-only snapshot served to callers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::domain::{Position, PositionUpdate, ScanResult, Signal, StateTransition, TradingState};
use crate::error::{EngineError, Result};
use crate::risk::RiskMetrics;

/// Venue routing for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    /// Simulated fills against the paper venue
    #[default]
    Paper,
    /// Real orders on a live venue
    Live,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

impl FromStr for TradingMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(EngineError::validation(format!("unknown trading mode: {other}"))),
        }
    }
}

/// Control messages handled by the engine loop
#[derive(Debug)]
pub enum EngineCommand {
    /// Load a preset (or the default) and begin scanning
    Start {
        preset: Option<String>,
        mode: TradingMode,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop the pipeline; open positions are left untouched
    Stop { reply: oneshot::Sender<Result<()>> },
    /// Suspend new entries, keep managing open positions
    Pause { reply: oneshot::Sender<Result<()>> },
    Resume { reply: oneshot::Sender<Result<()>> },
    /// Latch the kill switch and switch to exits only
    EmergencyStop {
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Swap the active preset without restarting
    Reload {
        preset: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Notifications published on every relevant change
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged(StateTransition),
    SignalEmitted(Signal),
    PositionUpdated {
        position: Position,
        update: Option<PositionUpdate>,
    },
    KillSwitch { reason: String },
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub session_id: Option<String>,
    pub state: TradingState,
    pub previous_state: Option<TradingState>,
    pub valid_next_states: Vec<TradingState>,
    pub last_reason: Option<String>,
    pub last_error: Option<String>,
    pub requires_reset: bool,
    pub preset: String,
    pub mode: TradingMode,
    pub equity: Decimal,
    pub entries_blocked: bool,
    pub open_positions: Vec<Position>,
    pub closed_positions: Vec<Position>,
    pub recent_signals: Vec<Signal>,
    pub scan_results: Vec<ScanResult>,
    pub risk: RiskMetrics,
    pub history: Vec<StateTransition>,
    pub transition_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            state: TradingState::Idle,
            previous_state: None,
            valid_next_states: TradingState::Idle.valid_transitions().to_vec(),
            last_reason: None,
            last_error: None,
            requires_reset: false,
            preset: String::new(),
            mode: TradingMode::Paper,
            equity: Decimal::ZERO,
            entries_blocked: false,
            open_positions: Vec::new(),
            closed_positions: Vec::new(),
            recent_signals: Vec::new(),
            scan_results: Vec::new(),
            risk: RiskMetrics::default(),
            history: Vec::new(),
            transition_count: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Clonable handle for driving a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshot: Arc<RwLock<EngineSnapshot>>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<EngineCommand>,
        events: broadcast::Sender<EngineEvent>,
        snapshot: Arc<RwLock<EngineSnapshot>>,
    ) -> Self {
        Self {
            commands,
            events,
            snapshot,
        }
    }

    async fn request<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> EngineCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| EngineError::Internal("engine loop is not running".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("engine dropped the command".into()))?
    }

    pub async fn start(&self, preset: Option<String>, mode: TradingMode) -> Result<()> {
        self.request(|reply| EngineCommand::Start {
            preset,
            mode,
            reply,
        })
        .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Stop { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Resume { reply }).await
    }

    pub async fn emergency_stop(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| EngineCommand::EmergencyStop { reason, reply })
            .await
    }

    pub async fn reload(&self, preset: impl Into<String>) -> Result<()> {
        let preset = preset.into();
        self.request(|reply| EngineCommand::Reload { preset, reply })
            .await
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn state(&self) -> TradingState {
        self.snapshot.read().await.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("paper".parse::<TradingMode>().unwrap(), TradingMode::Paper);
        assert_eq!("LIVE".parse::<TradingMode>().unwrap(), TradingMode::Live);
        assert!("demo".parse::<TradingMode>().is_err());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (tx, mut rx) = mpsc::channel(4);
        let (events, _) = broadcast::channel(4);
        let handle = EngineHandle::new(tx, events, Arc::new(RwLock::new(EngineSnapshot::default())));

        let responder = tokio::spawn(async move {
            if let Some(EngineCommand::Pause { reply }) = rx.recv().await {
                let _ = reply.send(Ok(()));
            }
        });
        handle.pause().await.unwrap();
        responder.await.unwrap();
        assert_eq!(handle.state().await, TradingState::Idle);
    }

    #[tokio::test]
    async fn test_closed_loop_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (events, _) = broadcast::channel(4);
        let handle = EngineHandle::new(tx, events, Arc::new(RwLock::new(EngineSnapshot::default())));
        assert!(handle.stop().await.is_err());
    }
}
