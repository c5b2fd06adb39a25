use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-feed cycle state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleState {
    /// Waiting for the next tick
    Idle,
    /// Requesting attestations from the oracle
    Fetching,
    /// Encoding attestations into an update payload
    Formatting,
    /// Transaction queued, broadcast or awaiting confirmations
    Submitting,
    /// A stage failed; backoff before returning to Idle
    Failed,
    /// Fatal failure, feed no longer scheduled
    Halted,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "IDLE",
            CycleState::Fetching => "FETCHING",
            CycleState::Formatting => "FORMATTING",
            CycleState::Submitting => "SUBMITTING",
            CycleState::Failed => "FAILED",
            CycleState::Halted => "HALTED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::*;

        match (self, target) {
            // From Idle
            (Idle, Fetching) => true,

            // From Fetching
            (Fetching, Formatting) => true,
            (Fetching, Idle) => true, // Nothing worth pushing
            (Fetching, Failed) => true,

            // From Formatting
            (Formatting, Submitting) => true,
            (Formatting, Failed) => true,

            // From Submitting
            (Submitting, Idle) => true, // Confirmed
            (Submitting, Failed) => true,

            // From Failed
            (Failed, Idle) => true,   // Backoff done
            (Failed, Halted) => true, // Fatal

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<CycleState> {
        use CycleState::*;

        match self {
            Idle => vec![Fetching],
            Fetching => vec![Formatting, Idle, Failed],
            Formatting => vec![Submitting, Failed],
            Submitting => vec![Idle, Failed],
            Failed => vec![Idle, Halted],
            Halted => vec![],
        }
    }

    /// Is a cycle currently running?
    pub fn is_in_cycle(&self) -> bool {
        matches!(
            self,
            CycleState::Fetching | CycleState::Formatting | CycleState::Submitting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Halted)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for CycleState {
    fn default() -> Self {
        CycleState::Idle
    }
}
