//! Critical gap analysis over raw researcher outputs

use super::{render_outputs, require_outputs};
use crate::dispatch::ResearcherOutput;
use crate::integrations::ConversationalAgent;
use crate::session::{Message, UserContext};
use crate::{GtmError, Result};
use std::sync::Arc;

const DIRECTIVE: &str = "You are a skeptical research reviewer. Using only the raw researcher \
outputs provided, identify weak evidence, contradictions between researchers, unstated \
assumptions, and questions the research left unanswered that matter for the user's decision. \
Rank every gap by its relevance to the strategic WHY in the user context, most relevant \
first, and treat the user's must-have priorities and constraints as the bar the evidence has \
to clear. Recommend what the next drop should investigate. Output a standalone markdown \
document.";

pub struct CriticalAnalyst {
    agent: Arc<dyn ConversationalAgent>,
}

impl CriticalAnalyst {
    pub fn new(agent: Arc<dyn ConversationalAgent>) -> Self {
        Self { agent }
    }

    pub async fn analyze(
        &self,
        drop_id: &str,
        user_context: Option<&UserContext>,
        outputs: &[ResearcherOutput],
    ) -> Result<String> {
        require_outputs(outputs, "critical analysis")?;

        let mut prompt = format!("Drop ID: {}\n\n", drop_id);
        match user_context {
            Some(ctx) => {
                prompt.push_str("<user_context>\n");
                prompt.push_str(&ctx.to_markdown());
                prompt.push_str("</user_context>\n\n");
            }
            None => prompt.push_str(
                "No user context was captured; rank gaps by how much they weaken the findings.\n\n",
            ),
        }
        prompt.push_str(&render_outputs(outputs));

        let analysis = self
            .agent
            .complete(&[Message::user(prompt)], DIRECTIVE)
            .await?;
        if analysis.trim().is_empty() {
            return Err(GtmError::Agent(
                "critical analysis returned an empty document".to_string(),
            ));
        }
        Ok(analysis)
    }
}
