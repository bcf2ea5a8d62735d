//! Research dispatch
//!
//! - **dispatcher**: concurrent fan-out with retry and cooperative cancellation
//! - **mission**: guidance handed to each researcher
//! - **output**: persisted researcher outputs
//! - **status**: per-researcher status and progress events

mod dispatcher;
pub mod mission;
mod output;
mod status;

pub use dispatcher::{DispatchReport, ResearchDispatcher};
pub use mission::{build_guidance, MissionContext};
pub use output::{OutputMeta, ResearcherOutput};
pub use status::{DispatchEvent, ResearcherStatus};
