use std::collections::VecDeque;
use tracing::{info, warn};

use crate::domain::{StateTransition, TradingState};
use crate::error::{EngineError, Result};

/// Engine lifecycle state with a bounded transition history.
///
/// Transitions are checked against [`TradingState::valid_transitions`]; a
/// rejected transition leaves every field untouched.
#[derive(Debug)]
pub struct StateMachine {
    current: TradingState,
    previous: Option<TradingState>,
    history: VecDeque<StateTransition>,
    capacity: usize,
    transition_count: u64,
}

impl StateMachine {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: TradingState::Idle,
            previous: None,
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            transition_count: 0,
        }
    }

    pub fn current(&self) -> TradingState {
        self.current
    }

    pub fn previous(&self) -> Option<TradingState> {
        self.previous
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.history.back()
    }

    pub fn valid_next_states(&self) -> &'static [TradingState] {
        self.current.valid_transitions()
    }

    pub fn can_transition_to(&self, to: TradingState) -> bool {
        self.current.can_transition_to(to)
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn is_error(&self) -> bool {
        self.current.is_error()
    }

    pub fn is_trading_active(&self) -> bool {
        self.current.is_trading_active()
    }

    /// Move to `to`, recording why
    pub fn transition(
        &mut self,
        to: TradingState,
        reason: impl Into<String>,
    ) -> Result<StateTransition> {
        self.apply(StateTransition::new(self.current, to, reason))
    }

    /// Like [`StateMachine::transition`] with extra metadata on the record
    pub fn transition_with(
        &mut self,
        to: TradingState,
        reason: impl Into<String>,
        metadata: &[(&str, String)],
    ) -> Result<StateTransition> {
        let record = metadata
            .iter()
            .fold(StateTransition::new(self.current, to, reason), |t, (k, v)| {
                t.with_metadata(*k, v.clone())
            });
        self.apply(record)
    }

    fn apply(&mut self, record: StateTransition) -> Result<StateTransition> {
        let to = record.to;
        if !self.current.can_transition_to(to) {
            warn!(
                from = %self.current,
                to = %to,
                reason = %record.reason,
                "rejected state transition"
            );
            return Err(EngineError::InvalidStateTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }

        info!(from = %self.current, to = %to, reason = %record.reason, "state transition");
        self.previous = Some(self.current);
        self.current = to;
        self.transition_count += 1;
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        Ok(record)
    }
}
