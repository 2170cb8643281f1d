//! Pipeline controller states and their legal transitions.

use std::fmt;

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Idle,
    Preflight,
    Acquiring,
    BuildRootActive,
    Installing,
    Composing,
    GeneratingBoot,
    /// Filesystem compression and bootloader configuration, run side by side.
    #[serde(rename = "Compressing+Configuring")]
    CompressingConfiguring,
    Assembling,
    TearingDown,
    Done,
    Failed,
}

impl State {
    /// Successor on the success path.
    pub fn next(self) -> Option<State> {
        use State::*;
        Some(match self {
            Idle => Preflight,
            Preflight => Acquiring,
            Acquiring => BuildRootActive,
            BuildRootActive => Installing,
            Installing => Composing,
            Composing => GeneratingBoot,
            GeneratingBoot => CompressingConfiguring,
            CompressingConfiguring => Assembling,
            Assembling => TearingDown,
            TearingDown => Done,
            Done | Failed => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }

    /// Every non-terminal state may abort into `TearingDown`, and teardown
    /// ends in either terminal state.
    pub fn can_transition(self, to: State) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            State::TearingDown => self != State::TearingDown,
            State::Failed => true,
            _ => self.next() == Some(to),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::Preflight => "Preflight",
            State::Acquiring => "Acquiring",
            State::BuildRootActive => "BuildRootActive",
            State::Installing => "Installing",
            State::Composing => "Composing",
            State::GeneratingBoot => "GeneratingBoot",
            State::CompressingConfiguring => "Compressing+Configuring",
            State::Assembling => "Assembling",
            State::TearingDown => "TearingDown",
            State::Done => "Done",
            State::Failed => "Failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the path taken to reach it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: State,
    visited: Vec<State>,
    /// Last working state before teardown began.
    interrupted_at: Option<State>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: State::Idle,
            visited: vec![State::Idle],
            interrupted_at: None,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn visited(&self) -> &[State] {
        &self.visited
    }

    /// Where the run was when it left the success path, if it did.
    pub fn interrupted_at(&self) -> Option<State> {
        self.interrupted_at
    }

    /// Move to `to`. Illegal transitions are a controller bug.
    pub fn transition(&mut self, to: State) {
        debug_assert!(
            self.current.can_transition(to),
            "illegal transition {} -> {}",
            self.current,
            to
        );
        if to == State::TearingDown && self.current.next() != Some(State::TearingDown) {
            self.interrupted_at = Some(self.current);
        }
        info!(from = %self.current, to = %to, "pipeline state");
        self.current = to;
        self.visited.push(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_done() {
        let mut sm = StateMachine::new();
        while let Some(next) = sm.current().next() {
            sm.transition(next);
        }
        assert_eq!(sm.current(), State::Done);
        assert_eq!(sm.visited().len(), 11);
        assert!(sm.visited().contains(&State::TearingDown));
        assert_eq!(sm.interrupted_at(), None);
    }

    #[test]
    fn every_working_state_can_abort() {
        let mut state = State::Idle;
        while let Some(next) = state.next() {
            if state != State::TearingDown {
                assert!(state.can_transition(State::TearingDown), "{state}");
            }
            state = next;
        }
        assert!(State::TearingDown.can_transition(State::Failed));
        assert!(State::TearingDown.can_transition(State::Done));
        assert!(!State::Done.can_transition(State::TearingDown));
        assert!(!State::Installing.can_transition(State::Assembling));
    }

    #[test]
    fn abort_records_where_it_happened() {
        let mut sm = StateMachine::new();
        sm.transition(State::Preflight);
        sm.transition(State::Acquiring);
        sm.transition(State::TearingDown);
        sm.transition(State::Failed);
        assert_eq!(sm.interrupted_at(), Some(State::Acquiring));
    }

    #[test]
    fn display_matches_serde_name() {
        let json = serde_json::to_string(&State::CompressingConfiguring).unwrap();
        assert_eq!(json, format!("\"{}\"", State::CompressingConfiguring));
    }
}
