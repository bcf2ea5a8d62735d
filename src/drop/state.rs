//! Drop lifecycle states and the persisted state record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a drop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropState {
    /// Plan accepted, no research started
    Proposed,

    /// Research tasks dispatched
    Researching,

    /// Outputs being synthesized
    Synthesizing,

    /// Both synthesis passes persisted
    Complete,

    /// Stopped on an error
    Failed,

    /// Stopped by the operator
    Cancelled,
}

impl DropState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Researching => "researching",
            Self::Synthesizing => "synthesizing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// States a restart must pick up
    pub fn is_incomplete(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: DropState) -> bool {
        use DropState::*;
        match (self, next) {
            (Proposed, Researching) | (Researching, Synthesizing) | (Synthesizing, Complete) => {
                true
            }
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DropState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DropState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "researching" => Ok(Self::Researching),
            "synthesizing" => Ok(Self::Synthesizing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown drop state: {}", other)),
        }
    }
}

/// A research assignment that did not produce an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAssignment {
    pub researcher_id: String,
    pub reason: String,
}

/// Contents of `drop-state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropStateRecord {
    pub drop_id: String,
    pub state: DropState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Cause recorded when the drop failed or was cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_assignments: Vec<FailedAssignment>,
}

impl DropStateRecord {
    pub fn new(drop_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            drop_id: drop_id.into(),
            state: DropState::Proposed,
            created_at: now,
            updated_at: now,
            error: None,
            failed_assignments: Vec::new(),
        }
    }

    /// Complete, but some assignments produced nothing
    pub fn is_degraded(&self) -> bool {
        self.state == DropState::Complete && !self.failed_assignments.is_empty()
    }

    /// Human-readable note on failed assignments, if any
    pub fn failure_note(&self) -> Option<String> {
        if self.failed_assignments.is_empty() {
            return None;
        }
        let ids: Vec<&str> = self
            .failed_assignments
            .iter()
            .map(|f| f.researcher_id.as_str())
            .collect();
        Some(format!(
            "{} of the planned assignments failed: {}",
            ids.len(),
            ids.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(DropState::Proposed.can_transition_to(DropState::Researching));
        assert!(DropState::Researching.can_transition_to(DropState::Synthesizing));
        assert!(DropState::Synthesizing.can_transition_to(DropState::Complete));

        assert!(!DropState::Proposed.can_transition_to(DropState::Synthesizing));
        assert!(!DropState::Researching.can_transition_to(DropState::Proposed));
        assert!(!DropState::Proposed.can_transition_to(DropState::Proposed));
    }

    #[test]
    fn test_failure_from_any_active_state() {
        for state in [
            DropState::Proposed,
            DropState::Researching,
            DropState::Synthesizing,
        ] {
            assert!(state.can_transition_to(DropState::Failed));
            assert!(state.can_transition_to(DropState::Cancelled));
            assert!(state.is_incomplete());
        }
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for state in [DropState::Complete, DropState::Failed, DropState::Cancelled] {
            assert!(state.is_terminal());
            for next in [
                DropState::Proposed,
                DropState::Researching,
                DropState::Synthesizing,
                DropState::Complete,
                DropState::Failed,
                DropState::Cancelled,
            ] {
                assert!(!state.can_transition_to(next), "{} -> {}", state, next);
            }
        }
    }

    #[test]
    fn test_state_strings() {
        assert_eq!("synthesizing".parse::<DropState>().unwrap(), DropState::Synthesizing);
        assert!("done".parse::<DropState>().is_err());
        let json = serde_json::to_string(&DropState::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn test_degraded_record() {
        let mut record = DropStateRecord::new("drop-1");
        assert!(!record.is_degraded());
        assert!(record.failure_note().is_none());

        record.state = DropState::Complete;
        record.failed_assignments.push(FailedAssignment {
            researcher_id: "researcher-2".to_string(),
            reason: "timeout".to_string(),
        });
        assert!(record.is_degraded());
        assert!(record.failure_note().unwrap().contains("researcher-2"));
    }
}
