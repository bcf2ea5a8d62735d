//! Progressive metadata index
//!
//! Small summaries an agent can load before deciding which full artifacts to
//! open. Summaries are built from file sizes, state records and output
//! sidecars; researcher output bodies are never read.

use crate::dispatch::OutputMeta;
use crate::drop::{DropState, DropStateMachine};
use crate::session::{excerpt, SessionState, UserContext};
use crate::storage::layout::{researcher_id_from_output, RESEARCHER_OUTPUT_GLOB};
use crate::storage::{DropLayout, DurableStore, SessionLayout};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Size every summary is expected to stay under
pub const SUMMARY_SIZE_TARGET: usize = 2048;

const EXCERPT_CHARS: usize = 200;
/// Used when an output has no sidecar: USD per 1K tokens
const FALLBACK_COST_PER_1K_TOKENS: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearcherSummary {
    pub researcher_id: String,
    pub output_file: String,
    pub token_count: u64,
    pub cost: f64,
    pub source_count: usize,
}

/// Contents of `drop-metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropSummary {
    pub drop_id: String,
    pub state: DropState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub hypothesis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_context: Option<String>,
    pub researchers: Vec<ResearcherSummary>,
    pub researchers_count: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_assignments: Vec<String>,
}

/// One line per drop in the session summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropDigest {
    pub drop_id: String,
    pub state: DropState,
    pub researchers_count: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Contents of `session-metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub total_drops: usize,
    pub total_researchers: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub drops: Vec<DropDigest>,
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reads and writes summaries for one session
pub struct MetadataIndex {
    store: DurableStore,
    session: SessionLayout,
}

impl MetadataIndex {
    pub fn new(store: DurableStore, session: SessionLayout) -> Self {
        Self { store, session }
    }

    fn machine(&self) -> DropStateMachine {
        DropStateMachine::new(self.store.clone(), self.session.clone())
    }

    fn summarize_researcher(&self, drop: &DropLayout, file: &str) -> Result<ResearcherSummary> {
        let researcher_id = researcher_id_from_output(file).unwrap_or(file).to_string();
        let len = self.store.file_len(drop.base().join(file))?;
        let token_count = if len == 0 { 0 } else { (len / 4).max(1) };
        let meta: Option<OutputMeta> =
            self.store.read_json_optional(drop.researcher_meta(&researcher_id))?;

        let (cost, source_count) = match meta {
            Some(meta) => (meta.cost, meta.sources.len()),
            None => (token_count as f64 / 1000.0 * FALLBACK_COST_PER_1K_TOKENS, 0),
        };

        Ok(ResearcherSummary {
            researcher_id,
            output_file: file.to_string(),
            token_count,
            cost: round_cents(cost),
            source_count,
        })
    }

    /// Build a drop's summary from its state, plan and output sizes
    pub fn summarize_drop(&self, drop_id: &str) -> Result<DropSummary> {
        let machine = self.machine();
        let drop = machine.layout(drop_id)?;
        let record = machine.load(drop_id)?;
        let hypothesis = machine
            .load_plan(drop_id)
            .map(|p| excerpt(&p.hypothesis, EXCERPT_CHARS))
            .unwrap_or_default();

        let user_context = self
            .store
            .read_optional(drop.user_context())?
            .map(|md| user_context_excerpt(&md));

        let researchers = self
            .store
            .glob(drop.base(), RESEARCHER_OUTPUT_GLOB)?
            .iter()
            .map(|file| self.summarize_researcher(&drop, file))
            .collect::<Result<Vec<_>>>()?;

        let total_tokens = researchers.iter().map(|r| r.token_count).sum();
        let total_cost = round_cents(researchers.iter().map(|r| r.cost).sum());

        Ok(DropSummary {
            drop_id: drop_id.to_string(),
            state: record.state,
            created_at: record.created_at,
            updated_at: record.updated_at,
            hypothesis,
            user_context,
            researchers_count: researchers.len(),
            researchers,
            total_tokens,
            total_cost,
            failed_assignments: record
                .failed_assignments
                .into_iter()
                .map(|f| f.researcher_id)
                .collect(),
        })
    }

    pub fn write_drop_summary(&self, drop_id: &str) -> Result<DropSummary> {
        let summary = self.summarize_drop(drop_id)?;
        let drop = self.session.drop(drop_id)?;
        self.store.write_json(drop.metadata(), &summary)?;
        debug!(drop_id, researchers = summary.researchers_count, "Drop metadata written");
        Ok(summary)
    }

    pub fn read_drop_summary(&self, drop_id: &str) -> Result<DropSummary> {
        self.store.read_json(self.session.drop(drop_id)?.metadata())
    }

    /// Aggregate every drop in the session
    pub fn summarize_session(&self) -> Result<SessionSummary> {
        let machine = self.machine();
        let state: Option<SessionState> = self.store.read_json_optional(self.session.state())?;

        let drop_ids = machine.list_drops()?;
        let (created_at, last_updated) = match self.artifact_times(&drop_ids)? {
            Some((oldest, newest)) => (Some(oldest), Some(newest)),
            None => (None, None),
        };

        let mut drops = Vec::new();
        for drop_id in drop_ids {
            let summary = match self.summarize_drop(&drop_id) {
                Ok(summary) => summary,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            drops.push(DropDigest {
                drop_id: summary.drop_id,
                state: summary.state,
                researchers_count: summary.researchers_count,
                total_tokens: summary.total_tokens,
                total_cost: summary.total_cost,
            });
        }

        Ok(SessionSummary {
            session_id: self.session.session_id().to_string(),
            mode: state.map(|s| s.mode.to_string()),
            created_at,
            last_updated,
            total_drops: drops.len(),
            total_researchers: drops.iter().map(|d| d.researchers_count).sum(),
            total_tokens: drops.iter().map(|d| d.total_tokens).sum(),
            total_cost: round_cents(drops.iter().map(|d| d.total_cost).sum()),
            drops,
        })
    }

    /// Oldest and newest modification time across the session's artifacts
    ///
    /// Metadata files are left out so a summary never dates itself.
    fn artifact_times(
        &self,
        drop_ids: &[String],
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let mut files = vec![
            self.session.state(),
            self.session.conversation(),
            self.session.latest(),
        ];
        for drop_id in drop_ids {
            let drop = self.session.drop(drop_id)?;
            let metadata = drop.metadata();
            for name in self.store.glob(drop.base(), "*")? {
                let path = drop.base().join(&name);
                if !name.starts_with('.') && path != metadata {
                    files.push(path);
                }
            }
        }

        let mut range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for file in files {
            let modified = match self.store.modified(&file) {
                Ok(modified) => modified,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            range = Some(match range {
                Some((oldest, newest)) => (oldest.min(modified), newest.max(modified)),
                None => (modified, modified),
            });
        }
        Ok(range)
    }

    pub fn write_session_summary(&self) -> Result<SessionSummary> {
        let summary = self.summarize_session()?;
        self.store.write_json(self.session.metadata(), &summary)?;
        Ok(summary)
    }

    pub fn read_session_summary(&self) -> Result<SessionSummary> {
        self.store.read_json(self.session.metadata())
    }

    /// Rewrite the drop summary and then the session summary
    pub fn refresh(&self, drop_id: &str) -> Result<(DropSummary, SessionSummary)> {
        let drop = self.write_drop_summary(drop_id)?;
        let session = self.write_session_summary()?;
        Ok((drop, session))
    }
}

/// Strategic WHY paragraph of a persisted user context, shortened
fn user_context_excerpt(markdown: &str) -> String {
    if let Ok(ctx) = UserContext::from_markdown(markdown) {
        return ctx.summary(EXCERPT_CHARS);
    }
    let body: String = markdown
        .split("## Strategic WHY")
        .nth(1)
        .unwrap_or(markdown)
        .split("\n## ")
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    excerpt(&body, EXCERPT_CHARS)
}
