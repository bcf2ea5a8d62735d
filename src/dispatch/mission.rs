//! Researcher guidance
//!
//! Everything a researcher knows about why it is researching comes from the
//! guidance built here.

use crate::drop::ResearcherAssignment;
use crate::session::{ResearchMode, UserContext};

/// Outputs outside this range usually mean the researcher misread its budget
pub const TARGET_TOKENS_MIN: usize = 2000;
pub const TARGET_TOKENS_MAX: usize = 5000;

/// Inputs shared by every assignment in a drop
#[derive(Debug, Clone, Copy)]
pub struct MissionContext<'a> {
    pub hypothesis: &'a str,
    pub user_context: Option<&'a UserContext>,
    pub mode: ResearchMode,
}

pub fn build_guidance(mission: &MissionContext<'_>, assignment: &ResearcherAssignment) -> String {
    let mut out = String::new();
    out.push_str("# Mission Briefing\n\n");
    out.push_str(&format!("## Focus Question\n\n{}\n\n", assignment.focus_question));

    if let Some(ctx) = mission.user_context {
        out.push_str("## Strategic Context\n\n");
        out.push_str(&format!("**Why this matters:** {}\n\n", ctx.strategic_why));
        out.push_str(&format!("**Decision it informs:** {}\n\n", ctx.decision_context));
        out.push_str(&format!("**Success looks like:** {}\n\n", ctx.success_criteria));
        if !ctx.priorities.must_have.is_empty() {
            out.push_str("**Must cover:**\n");
            for item in &ctx.priorities.must_have {
                out.push_str(&format!("- {}\n", item));
            }
            out.push('\n');
        }
        if !ctx.constraints.is_empty() {
            out.push_str("## Constraints\n\n");
            for item in &ctx.constraints {
                out.push_str(&format!("- {}\n", item));
            }
            out.push('\n');
        }
    }

    if !mission.hypothesis.is_empty() {
        out.push_str(&format!(
            "## Hypothesis Under Test\n\n{}\n\nLook for evidence against it as hard as evidence for it.\n\n",
            mission.hypothesis
        ));
    }

    if let Some(ref context) = assignment.context {
        out.push_str(&format!("## Assignment Notes\n\n{}\n\n", context));
    }

    out.push_str(&format!(
        "## Approach\n\n{}\n\n## Output\n\nAim for about {} tokens. Cite every claim. \
         Flag weak or conflicting evidence explicitly.\n",
        mission.mode.research_focus(),
        assignment.token_budget
    ));
    out
}
