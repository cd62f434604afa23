//! Session lifecycle phases

use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// Offer sent, waiting for the answer
    Negotiating,
    /// Answer applied, transcoder not yet running
    Answered,
    /// Media flowing to the transcoder
    Active,
    /// Teardown in progress
    Ending,
    Ended,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Ended | SessionPhase::Failed)
    }

    /// Allowed transitions. `Idle -> Active` is the recording relay path,
    /// which has no negotiation.
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Negotiating) | (Idle, Active) => true,
            (Negotiating, Answered) => true,
            (Answered, Active) => true,
            (Idle | Negotiating | Answered | Active, Ending) => true,
            (Ending, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Negotiating => "negotiating",
            SessionPhase::Answered => "answered",
            SessionPhase::Active => "active",
            SessionPhase::Ending => "ending",
            SessionPhase::Ended => "ended",
            SessionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Current phase of one session, with transition logging
#[derive(Debug)]
pub struct PhaseTracker {
    device_id: String,
    phase: SessionPhase,
}

impl PhaseTracker {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            phase: SessionPhase::Idle,
        }
    }

    pub fn current(&self) -> SessionPhase {
        self.phase
    }

    /// Move to `next`; refused (and logged) when the transition is not allowed
    pub fn advance(&mut self, next: SessionPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(device_id = %self.device_id, from = %self.phase, to = %next, "refusing phase transition");
            return false;
        }
        debug!(device_id = %self.device_id, from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        true
    }
}
