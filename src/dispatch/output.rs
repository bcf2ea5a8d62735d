//! Researcher outputs
//!
//! Each output is two files: the markdown body, read by synthesis and by
//! people, and a small JSON sidecar carrying the figures the metadata index
//! needs without opening the body.

use crate::budget::estimate_tokens;
use crate::integrations::Source;
use crate::storage::layout::{researcher_id_from_output, RESEARCHER_OUTPUT_GLOB};
use crate::storage::{DropLayout, DurableStore};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of `researcher-<id>-meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub researcher_id: String,
    pub focus_question: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub token_count: usize,
    pub cost: f64,
    pub runtime_seconds: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResearcherOutput {
    /// Full markdown body as persisted
    pub body: String,
    pub meta: OutputMeta,
}

impl ResearcherOutput {
    pub fn new(
        researcher_id: &str,
        focus_question: &str,
        findings: &str,
        sources: Vec<Source>,
        cost: f64,
        runtime_seconds: f64,
    ) -> Self {
        let body = render_body(researcher_id, focus_question, findings, &sources);
        Self {
            meta: OutputMeta {
                researcher_id: researcher_id.to_string(),
                focus_question: focus_question.to_string(),
                sources,
                token_count: estimate_tokens(&body),
                cost,
                runtime_seconds,
                completed_at: Utc::now(),
            },
            body,
        }
    }

    pub fn researcher_id(&self) -> &str {
        &self.meta.researcher_id
    }

    /// Write body then sidecar; a re-run overwrites both wholesale
    pub fn persist(&self, store: &DurableStore, drop: &DropLayout) -> Result<()> {
        store.write(drop.researcher_output(self.researcher_id()), &self.body)?;
        store.write_json(drop.researcher_meta(self.researcher_id()), &self.meta)
    }

    /// Load one output; a missing sidecar is rebuilt from the body
    pub fn load(store: &DurableStore, drop: &DropLayout, researcher_id: &str) -> Result<Self> {
        let body = store.read(drop.researcher_output(researcher_id))?;
        let meta = match store.read_json_optional(drop.researcher_meta(researcher_id))? {
            Some(meta) => meta,
            None => OutputMeta {
                researcher_id: researcher_id.to_string(),
                focus_question: String::new(),
                sources: Vec::new(),
                token_count: estimate_tokens(&body),
                cost: 0.0,
                runtime_seconds: 0.0,
                completed_at: store.modified(drop.researcher_output(researcher_id))?,
            },
        };
        Ok(Self { body, meta })
    }

    /// Every output persisted in a drop, ordered by researcher id
    pub fn load_all(store: &DurableStore, drop: &DropLayout) -> Result<Vec<Self>> {
        store
            .glob(drop.base(), RESEARCHER_OUTPUT_GLOB)?
            .iter()
            .filter_map(|file| researcher_id_from_output(file))
            .map(|id| Self::load(store, drop, id))
            .collect()
    }
}

fn render_body(researcher_id: &str, focus_question: &str, findings: &str, sources: &[Source]) -> String {
    let mut body = format!(
        "# Research Output: {}\n\n**Focus:** {}\n\n{}\n",
        researcher_id,
        focus_question,
        findings.trim()
    );
    if !sources.is_empty() {
        body.push_str("\n## Sources\n\n");
        for source in sources {
            match source.title {
                Some(ref title) => body.push_str(&format!("- [{}]({})\n", title, source.url)),
                None => body.push_str(&format!("- {}\n", source.url)),
            }
        }
    }
    body
}
