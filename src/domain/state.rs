use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Engine state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingState {
    /// Constructed, not started
    Idle,
    /// Loading preset, fetching balance, reconciling
    Initializing,
    /// Refreshing market data and screening the universe
    Scanning,
    /// Detecting levels and ranking candidates
    LevelBuilding,
    /// Evaluating entry strategies on candidates
    SignalWait,
    /// Risk checks and position sizing
    Sizing,
    /// Placing entry orders
    Execution,
    /// Managing open positions
    Managing,
    /// New entries suspended by operator
    Paused,
    /// Recoverable failure
    Error,
    /// Kill switch or fatal venue error; exits only
    Emergency,
    /// Terminal
    Stopped,
}

impl TradingState {
    pub const ALL: [TradingState; 12] = [
        TradingState::Idle,
        TradingState::Initializing,
        TradingState::Scanning,
        TradingState::LevelBuilding,
        TradingState::SignalWait,
        TradingState::Sizing,
        TradingState::Execution,
        TradingState::Managing,
        TradingState::Paused,
        TradingState::Error,
        TradingState::Emergency,
        TradingState::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingState::Idle => "IDLE",
            TradingState::Initializing => "INITIALIZING",
            TradingState::Scanning => "SCANNING",
            TradingState::LevelBuilding => "LEVEL_BUILDING",
            TradingState::SignalWait => "SIGNAL_WAIT",
            TradingState::Sizing => "SIZING",
            TradingState::Execution => "EXECUTION",
            TradingState::Managing => "MANAGING",
            TradingState::Paused => "PAUSED",
            TradingState::Error => "ERROR",
            TradingState::Emergency => "EMERGENCY",
            TradingState::Stopped => "STOPPED",
        }
    }

    /// Static adjacency table
    pub fn valid_transitions(&self) -> &'static [TradingState] {
        use TradingState::*;

        match self {
            Idle => &[Initializing, Paused, Error, Emergency, Stopped],
            Initializing => &[Scanning, Paused, Error, Emergency, Stopped],
            Scanning => &[LevelBuilding, Managing, Paused, Error, Emergency, Stopped],
            LevelBuilding => &[SignalWait, Scanning, Paused, Error, Emergency, Stopped],
            SignalWait => &[Sizing, Managing, Scanning, Paused, Error, Emergency, Stopped],
            Sizing => &[Execution, Managing, Paused, Error, Emergency, Stopped],
            Execution => &[Managing, Paused, Error, Emergency, Stopped],
            Managing => &[Scanning, Paused, Error, Emergency, Stopped],
            Paused => &[Scanning, Managing, Error, Emergency, Stopped],
            Error => &[Initializing, Scanning, Paused, Emergency, Stopped],
            // Leaving EMERGENCY for the pipeline goes through stop and restart
            Emergency => &[Managing, Paused, Error, Stopped],
            // Reset back to Idle only through an explicit start
            Stopped => &[Idle],
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TradingState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradingState::Stopped)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TradingState::Error | TradingState::Emergency)
    }

    pub fn is_trading_active(&self) -> bool {
        matches!(
            self,
            TradingState::Sizing | TradingState::Execution | TradingState::Managing
        )
    }

    /// States in the scan → manage pipeline
    pub fn is_pipeline_stage(&self) -> bool {
        matches!(
            self,
            TradingState::Scanning
                | TradingState::LevelBuilding
                | TradingState::SignalWait
                | TradingState::Sizing
                | TradingState::Execution
                | TradingState::Managing
        )
    }
}

impl fmt::Display for TradingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TradingState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        let upper = s.to_uppercase();
        TradingState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("Unknown state: {}", s))
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TradingState,
    pub to: TradingState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StateTransition {
    pub fn new(from: TradingState, to: TradingState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
