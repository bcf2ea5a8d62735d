//! Synthesis pipeline
//!
//! Two independent passes over a drop's outputs:
//! - **latest**: folds new findings into the session's living Latest Document
//! - **critical**: gap analysis over the raw outputs only
//!
//! The critical pass never sees the Latest Document, so it cannot inherit
//! the synthesizer's framing.

mod critical;
mod latest;

pub use critical::CriticalAnalyst;
pub use latest::IncrementalSynthesizer;

use crate::dispatch::ResearcherOutput;
use crate::session::UserContext;
use crate::storage::{DropLayout, DurableStore, SessionLayout};
use crate::{GtmError, Result};
use tracing::info;

/// Render outputs as tagged blocks for an agent prompt
fn render_outputs(outputs: &[ResearcherOutput]) -> String {
    let mut out = String::new();
    for output in outputs {
        out.push_str(&format!(
            "<researcher_output id='{}'>\n{}\n</researcher_output>\n\n",
            output.researcher_id(),
            output.body.trim_end()
        ));
    }
    out
}

fn require_outputs(outputs: &[ResearcherOutput], pass: &str) -> Result<()> {
    if outputs.is_empty() {
        return Err(GtmError::EmptyInput(format!(
            "{} needs at least one researcher output",
            pass
        )));
    }
    Ok(())
}

/// Documents produced for one drop
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub latest: String,
    pub critical_analysis: String,
}

/// Runs both passes for a drop and persists their results
pub struct SynthesisPipeline {
    synthesizer: IncrementalSynthesizer,
    analyst: CriticalAnalyst,
}

impl SynthesisPipeline {
    pub fn new(synthesizer: IncrementalSynthesizer, analyst: CriticalAnalyst) -> Self {
        Self {
            synthesizer,
            analyst,
        }
    }

    /// Synthesize `outputs`, then write `latest.md` and `critical-analysis.md`
    ///
    /// Both passes run concurrently. Nothing is written unless both succeed.
    pub async fn run(
        &self,
        store: &DurableStore,
        session: &SessionLayout,
        drop: &DropLayout,
        user_context: Option<&UserContext>,
        outputs: &[ResearcherOutput],
    ) -> Result<SynthesisResult> {
        require_outputs(outputs, "synthesis")?;
        let previous = store.read_optional(session.latest())?;

        let (latest, critical_analysis) = futures::try_join!(
            self.synthesizer.synthesize(
                drop.drop_id(),
                previous.as_deref(),
                user_context,
                outputs
            ),
            self.analyst.analyze(drop.drop_id(), user_context, outputs),
        )?;

        store.write(drop.critical_analysis(), &critical_analysis)?;
        store.write(session.latest(), &latest)?;
        info!(
            drop_id = drop.drop_id(),
            latest_chars = latest.len(),
            analysis_chars = critical_analysis.len(),
            "Synthesis persisted"
        );

        Ok(SynthesisResult {
            latest,
            critical_analysis,
        })
    }
}
