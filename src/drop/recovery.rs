//! Crash recovery: what an interrupted drop has on disk and where to resume

use super::machine::DropStateMachine;
use super::state::DropState;
use crate::{GtmError, Result};
use serde::Serialize;
use std::fmt;

/// Where an interrupted drop picks up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    /// Nothing dispatched yet
    RestartResearch,
    /// Some assignments still lack outputs
    ResumeResearch,
    /// All outputs exist, synthesis did not finish
    RunSynthesis,
}

impl fmt::Display for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RestartResearch => "restart research",
            Self::ResumeResearch => "resume research",
            Self::RunSynthesis => "run synthesis",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPlan {
    pub drop_id: String,
    pub state: DropState,
    pub has_user_context: bool,
    pub has_conversation: bool,
    pub completed: Vec<String>,
    pub missing: Vec<String>,
    pub next_step: NextStep,
}

impl DropStateMachine {
    /// Inspect an incomplete drop and decide how to continue it
    pub fn recovery_plan(&self, drop_id: &str) -> Result<RecoveryPlan> {
        let record = self.load(drop_id)?;
        if record.state.is_terminal() {
            return Err(GtmError::Other(format!(
                "{} is {} and cannot be resumed",
                drop_id, record.state
            )));
        }

        let layout = self.layout(drop_id)?;
        let plan = self.load_plan(drop_id)?;
        let (completed, missing): (Vec<String>, Vec<String>) = plan
            .assignments
            .iter()
            .map(|a| a.id.clone())
            .partition(|id| self.store().exists(layout.researcher_output(id)));

        let next_step = match record.state {
            DropState::Proposed => NextStep::RestartResearch,
            DropState::Researching if !missing.is_empty() => NextStep::ResumeResearch,
            _ => NextStep::RunSynthesis,
        };

        Ok(RecoveryPlan {
            drop_id: drop_id.to_string(),
            state: record.state,
            has_user_context: self.store().exists(layout.user_context()),
            has_conversation: self.store().exists(layout.conversation()),
            completed,
            missing,
            next_step,
        })
    }
}
