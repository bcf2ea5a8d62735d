//! Conversation Session
//!
//! Owns the ordered message history of one session and delegates every turn
//! to the conversational agent. Extraction requests go through a side
//! channel: they see the full history but never become part of it.

use super::message::Message;
use super::state::SessionState;
use super::transcript::{format_transcript, parse_transcript};
use super::user_context::UserContext;
use super::ResearchMode;
use crate::budget::ContextBudgetTracker;
use crate::drop::DropPlan;
use crate::integrations::ConversationalAgent;
use crate::storage::layout::RESEARCHER_OUTPUT_GLOB;
use crate::storage::{DurableStore, ProjectLayout, SessionLayout};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

const USER_CONTEXT_REQUEST: &str = "Summarize what you have learned about my strategic intent. \
Respond with a single JSON object with exactly these fields: \
strategic_why (string), decision_context (string), mental_models (array of strings), \
priorities (object with must_have and nice_to_have arrays of strings), \
constraints (array of strings), success_criteria (string), hypothesis (string or null). \
Output only the JSON.";

const DROP_PLAN_REQUEST: &str = "Propose the next research drop. If you do not yet know enough, \
reply with NEEDS_CLARIFICATION followed by your question. Otherwise respond with a single JSON \
object: {\"hypothesis\": string, \"researchers_assigned\": [{\"focus_question\": string, \
\"context\": string or null, \"token_budget\": integer}]} with 1 to 4 researchers. \
Output only the JSON.";

/// A live session: history, durable state and budget
pub struct ConversationSession {
    store: DurableStore,
    layout: SessionLayout,
    state: SessionState,
    messages: Vec<Message>,
    agent: Arc<dyn ConversationalAgent>,
    budget: ContextBudgetTracker,
}

impl ConversationSession {
    /// Open a session, restoring history and state if it already exists
    pub fn open(
        store: DurableStore,
        project: &ProjectLayout,
        session_id: &str,
        mode: ResearchMode,
        agent: Arc<dyn ConversationalAgent>,
    ) -> Result<Self> {
        let layout = project.session(session_id)?;

        let state = match store.read_json_optional::<SessionState>(layout.state())? {
            Some(state) => state,
            None => {
                let state = SessionState::new(session_id, mode);
                store.write_json(layout.state(), &state)?;
                info!(session_id, mode = %mode, "Created session");
                state
            }
        };

        let messages = match store.read_optional(layout.conversation())? {
            Some(text) => parse_transcript(&text)?,
            None => Vec::new(),
        };
        debug!(session_id, messages = messages.len(), "Opened session");

        let mut budget = ContextBudgetTracker::default();
        budget.add_conversation(&messages);

        Ok(Self {
            store,
            layout,
            state,
            messages,
            agent,
            budget,
        })
    }

    pub fn with_budget(mut self, mut budget: ContextBudgetTracker) -> Self {
        budget.add_conversation(&self.messages);
        self.budget = budget;
        self
    }

    pub fn session_id(&self) -> &str {
        self.layout.session_id()
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn mode(&self) -> ResearchMode {
        self.state.mode
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn budget(&self) -> &ContextBudgetTracker {
        &self.budget
    }

    pub fn budget_mut(&mut self) -> &mut ContextBudgetTracker {
        &mut self.budget
    }

    /// Switch research mode; applies to the next turn
    pub fn set_mode(&mut self, mode: ResearchMode) -> Result<()> {
        self.state.mode = mode;
        self.save_state()
    }

    /// Send a user message and return the agent's reply
    ///
    /// Both messages are appended and the transcript saved. If the agent
    /// fails, the user message is withdrawn so history stays paired.
    pub async fn send(&mut self, text: &str) -> Result<String> {
        self.messages.push(Message::user(text));
        let result = self
            .agent
            .complete(&self.messages, self.state.mode.directive())
            .await;
        self.finish_turn(result)
    }

    /// Like [`send`](Self::send), delivering the reply in chunks as it arrives
    ///
    /// Only the completed reply is appended to history.
    pub async fn send_streaming(
        &mut self,
        text: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String> {
        self.messages.push(Message::user(text));
        let result = self
            .agent
            .complete_streaming(&self.messages, self.state.mode.directive(), on_chunk)
            .await;
        self.finish_turn(result)
    }

    fn finish_turn(&mut self, result: Result<String>) -> Result<String> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.messages.pop();
                warn!(session_id = %self.session_id(), error = %e, "Agent turn failed");
                return Err(e);
            }
        };
        self.messages.push(Message::agent(response.clone()));
        self.after_change()?;
        Ok(response)
    }

    /// Ask the agent for the User Context, without touching history
    pub async fn extract_user_context(&self) -> Result<UserContext> {
        let raw = self.side_channel(USER_CONTEXT_REQUEST).await?;
        let context = UserContext::from_extraction(&raw)?;
        info!(session_id = %self.session_id(), "Extracted user context");
        Ok(context)
    }

    /// Ask the agent for a drop plan, without touching history
    ///
    /// `Ok(None)` means the agent wants clarification first.
    pub async fn extract_drop_plan(&self, drop_id: &str) -> Result<Option<DropPlan>> {
        let raw = self.side_channel(DROP_PLAN_REQUEST).await?;
        let plan = DropPlan::from_extraction(&raw, drop_id)?;
        match plan {
            Some(ref plan) => info!(
                drop_id,
                assignments = plan.assignments.len(),
                "Extracted drop plan"
            ),
            None => debug!(drop_id, "Agent asked for clarification instead of a plan"),
        }
        Ok(plan)
    }

    async fn side_channel(&self, request: &str) -> Result<String> {
        let mut probe = self.messages.clone();
        probe.push(Message::user(request));
        self.agent.complete(&probe, self.state.mode.directive()).await
    }

    /// Append a completed drop's outputs as one synthetic agent turn
    pub fn inject_drop_context(&mut self, drop_id: &str) -> Result<()> {
        let drop = self.layout.drop(drop_id)?;
        let mut body = format!(
            "Research results for {} are in. Raw researcher outputs and the critical analysis follow.\n",
            drop_id
        );

        let files = self.store.glob(drop.base(), RESEARCHER_OUTPUT_GLOB)?;
        for file in &files {
            let content = self.store.read(drop.base().join(file))?;
            body.push_str(&format!(
                "\n<researcher_output file='{}'>\n{}\n</researcher_output>\n",
                file, content
            ));
        }
        if let Some(analysis) = self.store.read_optional(drop.critical_analysis())? {
            body.push_str(&format!(
                "\n<critical_analysis>\n{}\n</critical_analysis>\n",
                analysis
            ));
        }

        self.messages.push(Message::agent(body));
        info!(drop_id, outputs = files.len(), "Injected drop context");
        self.after_change()
    }

    /// Record that `drop_id` is now the session's active drop
    pub fn begin_drop(&mut self, drop_id: &str) -> Result<()> {
        self.state.begin_drop(drop_id);
        self.save_state()
    }

    pub fn finish_drop(&mut self) -> Result<()> {
        self.state.finish_drop();
        self.save_state()
    }

    /// Id the next drop will get; never below what is already on disk
    pub fn next_drop_id(&self, highest_on_disk: u32) -> String {
        let mut state = self.state.clone();
        state.drop_counter = state.drop_counter.max(highest_on_disk);
        state.peek_next_drop_id()
    }

    /// Copy the current transcript into a drop directory
    pub fn snapshot_into(&self, drop_id: &str) -> Result<()> {
        let drop = self.layout.drop(drop_id)?;
        self.store
            .write(drop.conversation(), &format_transcript(&self.messages))
    }

    pub fn save(&self) -> Result<()> {
        self.store
            .write(self.layout.conversation(), &format_transcript(&self.messages))?;
        self.save_state()
    }

    fn save_state(&self) -> Result<()> {
        let mut state = self.state.clone();
        state.updated_at = Utc::now();
        self.store.write_json(self.layout.state(), &state)
    }

    fn after_change(&mut self) -> Result<()> {
        self.budget.add_conversation(&self.messages);
        if self.budget.should_warn() {
            warn!(
                session_id = %self.session_id(),
                usage = %self.budget.format_display(),
                "Context budget nearly exhausted"
            );
        }
        self.save()
    }
}

/// Session id from the first user message: `<slug>-<YYYYmmdd-HHMMSS>`
pub fn generate_session_id(first_message: &str) -> String {
    let slug: String = first_message
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(5)
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = slug.chars().take(40).collect();
    let slug = slug.trim_end_matches('-');
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    if slug.is_empty() {
        format!("session-{}", stamp)
    } else {
        format!("{}-{}", slug, stamp)
    }
}
