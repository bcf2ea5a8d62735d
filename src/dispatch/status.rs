//! Researcher status and dispatch events

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where one research assignment is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearcherStatus {
    Idle,
    Searching,
    Analyzing,
    Writing,
    Complete,
    Failed,
    Cancelled,
}

impl ResearcherStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Searching | Self::Analyzing | Self::Writing)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ResearcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Analyzing => "analyzing",
            Self::Writing => "writing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Progress notifications emitted while a drop's research runs
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    StatusChanged {
        researcher_id: String,
        old_status: ResearcherStatus,
        new_status: ResearcherStatus,
    },

    Completed {
        researcher_id: String,
        token_count: usize,
        cost: f64,
    },

    Failed {
        researcher_id: String,
        reason: String,
    },

    Cancelled(String),
}
