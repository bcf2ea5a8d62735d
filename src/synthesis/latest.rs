//! Incremental Latest Document synthesis

use super::{render_outputs, require_outputs};
use crate::dispatch::ResearcherOutput;
use crate::integrations::ConversationalAgent;
use crate::session::{Message, UserContext};
use crate::{GtmError, Result};
use std::sync::Arc;
use tracing::debug;

const DIRECTIVE: &str = "You maintain a living strategy document. Rewrite the document in full, \
integrating the new research. Never delete a superseded claim: strike it through as \
~~old claim~~ and state what replaced it and which drop the evidence came from. Keep the \
document organized around the user's strategic intent. Output only the markdown document.";

pub struct IncrementalSynthesizer {
    agent: Arc<dyn ConversationalAgent>,
}

impl IncrementalSynthesizer {
    pub fn new(agent: Arc<dyn ConversationalAgent>) -> Self {
        Self { agent }
    }

    /// Produce the next Latest Document from the previous one and new outputs
    ///
    /// The result always names `drop_id`.
    pub async fn synthesize(
        &self,
        drop_id: &str,
        previous: Option<&str>,
        user_context: Option<&UserContext>,
        outputs: &[ResearcherOutput],
    ) -> Result<String> {
        require_outputs(outputs, "incremental synthesis")?;

        let mut prompt = format!("Drop ID: {}\n\n", drop_id);
        match user_context {
            Some(ctx) => {
                prompt.push_str("<user_context>\n");
                prompt.push_str(&ctx.to_markdown());
                prompt.push_str("</user_context>\n\n");
            }
            None => prompt.push_str("No user context was captured for this drop.\n\n"),
        }
        match previous {
            Some(doc) => {
                prompt.push_str("<current_latest>\n");
                prompt.push_str(doc);
                prompt.push_str("\n</current_latest>\n\n");
            }
            None => prompt.push_str("There is no Latest Document yet; write the first version.\n\n"),
        }
        prompt.push_str("<new_findings>\n");
        prompt.push_str(&render_outputs(outputs));
        prompt.push_str("</new_findings>\n");

        debug!(drop_id, prompt_chars = prompt.len(), "Running incremental synthesis");
        let document = self
            .agent
            .complete(&[Message::user(prompt)], DIRECTIVE)
            .await?;
        if document.trim().is_empty() {
            return Err(GtmError::Agent("synthesis returned an empty document".to_string()));
        }
        Ok(ensure_drop_reference(document, drop_id))
    }
}

fn ensure_drop_reference(mut document: String, drop_id: &str) -> String {
    if !document.contains(drop_id) {
        if !document.ends_with('\n') {
            document.push('\n');
        }
        document.push_str(&format!("\n---\n_Last updated from {}_\n", drop_id));
    }
    document
}
