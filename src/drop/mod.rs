//! Drop lifecycle
//!
//! A drop is one batch of parallel research: a plan, N researcher outputs,
//! and two synthesis artifacts. Its state moves
//! `proposed -> researching -> synthesizing -> complete`, or ends early in
//! `failed` / `cancelled`.

mod machine;
pub mod plan;
mod recovery;
mod state;

pub use machine::DropStateMachine;
pub use plan::{assign_researcher_ids, DropPlan, ResearcherAssignment};
pub use recovery::{NextStep, RecoveryPlan};
pub use state::{DropState, DropStateRecord, FailedAssignment};
