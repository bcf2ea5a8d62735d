//! Headquarters
//!
//! Drives a session end to end: conversation turns, user context capture,
//! drop planning, research dispatch, synthesis and metadata. Every drop
//! moves through the persisted state machine so an interrupted run can be
//! resumed from disk.

use crate::budget::{LATEST_DOCUMENT, USER_CONTEXT};
use crate::config::FactoryConfig;
use crate::dispatch::{MissionContext, ResearchDispatcher, ResearcherOutput};
use crate::drop::{
    DropPlan, DropState, DropStateMachine, DropStateRecord, FailedAssignment, RecoveryPlan,
};
use crate::integrations::{ConversationalAgent, ResearchEngine};
use crate::metadata::MetadataIndex;
use crate::session::{ConversationSession, UserContext};
use crate::synthesis::{CriticalAnalyst, IncrementalSynthesizer, SynthesisPipeline};
use crate::{GtmError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Routes an interrupt to whichever drop is running
///
/// One listener serves a whole session; each drop gets a fresh token from
/// [`begin`](Self::begin) so an interrupt never outlives the drop it stopped.
#[derive(Debug, Clone, Default)]
pub struct DropInterrupts {
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl DropInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token for the drop about to run
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.running() = Some(token.clone());
        token
    }

    pub fn end(&self) {
        self.running().take();
    }

    /// Cancel the running drop; `false` when nothing was running
    pub fn interrupt(&self) -> bool {
        match self.running().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Result of a drop that reached `complete`
#[derive(Debug, Clone)]
pub struct DropOutcome {
    pub drop_id: String,
    pub state: DropState,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedAssignment>,
    pub latest: String,
}

impl DropOutcome {
    /// Completed with at least one failed assignment
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub struct Headquarters {
    session: ConversationSession,
    machine: DropStateMachine,
    dispatcher: ResearchDispatcher,
    synthesis: SynthesisPipeline,
    metadata: MetadataIndex,
    user_context: Option<UserContext>,
    auto_inject: bool,
}

impl Headquarters {
    pub fn new(
        session: ConversationSession,
        dispatcher: ResearchDispatcher,
        synthesis: SynthesisPipeline,
    ) -> Self {
        let store = session.store().clone();
        let layout = session.layout().clone();
        let machine = DropStateMachine::new(store.clone(), layout.clone());
        let user_context = restore_user_context(&machine);

        let mut hq = Self {
            session,
            machine,
            dispatcher,
            synthesis,
            metadata: MetadataIndex::new(store, layout),
            user_context: None,
            auto_inject: true,
        };
        if let Some(ctx) = user_context {
            hq.set_user_context(ctx);
        }
        hq
    }

    /// Wire dispatcher and synthesis from configuration
    pub fn from_config(
        config: &FactoryConfig,
        session: ConversationSession,
        agent: Arc<dyn ConversationalAgent>,
        engine: Arc<dyn ResearchEngine>,
    ) -> Self {
        let dispatcher = ResearchDispatcher::new(engine, session.store().clone())
            .with_retry(config.dispatch.retry.clone());
        let synthesis = SynthesisPipeline::new(
            IncrementalSynthesizer::new(agent.clone()),
            CriticalAnalyst::new(agent),
        );
        let mut hq = Self::new(session, dispatcher, synthesis);
        hq.auto_inject = config.dispatch.inject_results;
        hq
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ConversationSession {
        &mut self.session
    }

    pub fn machine(&self) -> &DropStateMachine {
        &self.machine
    }

    pub fn dispatcher(&self) -> &ResearchDispatcher {
        &self.dispatcher
    }

    pub fn metadata(&self) -> &MetadataIndex {
        &self.metadata
    }

    pub fn user_context(&self) -> Option<&UserContext> {
        self.user_context.as_ref()
    }

    pub fn set_user_context(&mut self, ctx: UserContext) {
        self.session
            .budget_mut()
            .add(USER_CONTEXT, &ctx.to_markdown());
        self.user_context = Some(ctx);
    }

    pub fn set_auto_inject(&mut self, enabled: bool) {
        self.auto_inject = enabled;
    }

    pub async fn send(&mut self, text: &str) -> Result<String> {
        self.session.send(text).await
    }

    /// Extract the User Context from the conversation and keep it for later drops
    pub async fn extract_user_context(&mut self) -> Result<UserContext> {
        let ctx = self.session.extract_user_context().await?;
        self.set_user_context(ctx.clone());
        Ok(ctx)
    }

    /// Ask the agent for the next drop plan; `None` means it needs clarification
    pub async fn propose_drop(&self) -> Result<Option<DropPlan>> {
        let drop_id = self
            .session
            .next_drop_id(self.machine.highest_drop_number()?);
        self.session.extract_drop_plan(&drop_id).await
    }

    /// Create a drop from `plan` and run it to completion
    ///
    /// On failure the drop is persisted as `failed` (or `cancelled`) and the
    /// error is returned.
    pub async fn run_drop(
        &mut self,
        plan: &DropPlan,
        cancel: &CancellationToken,
    ) -> Result<DropOutcome> {
        self.ensure_idle()?;
        let drop_id = plan.drop_id.clone();

        self.machine.create(plan)?;
        if let Err(e) = self.prepare(&drop_id) {
            self.record_failure(&drop_id, &e);
            return Err(e);
        }
        self.drive(&drop_id, cancel).await
    }

    /// Mark the drop active and snapshot the context it was planned under
    fn prepare(&mut self, drop_id: &str) -> Result<()> {
        self.session.begin_drop(drop_id)?;
        let drop = self.machine.layout(drop_id)?;
        if let Some(ctx) = &self.user_context {
            self.session
                .store()
                .write(drop.user_context(), &ctx.to_markdown())?;
        }
        self.session.snapshot_into(drop_id)
    }

    /// Continue an interrupted drop from whatever it has on disk
    pub async fn resume_drop(
        &mut self,
        drop_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DropOutcome> {
        let plan: RecoveryPlan = self.machine.recovery_plan(drop_id)?;
        info!(
            drop_id,
            state = %plan.state,
            next_step = %plan.next_step,
            missing = plan.missing.len(),
            "Resuming drop"
        );
        self.session.begin_drop(drop_id)?;
        self.drive(drop_id, cancel).await
    }

    /// Resume every incomplete drop in sequence order
    pub async fn recover_all(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Result<DropOutcome>)>> {
        let mut results = Vec::new();
        for record in self.machine.find_incomplete()? {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.resume_drop(&record.drop_id, cancel).await;
            results.push((record.drop_id, outcome));
        }
        Ok(results)
    }

    /// Operator disposition for a drop that will not be resumed
    pub fn mark_failed(&mut self, drop_id: &str, reason: &str) -> Result<DropStateRecord> {
        let record = self.machine.fail(drop_id, reason)?;
        if self.session.state().current_drop.as_deref() == Some(drop_id) {
            self.session.finish_drop()?;
        }
        if let Err(e) = self.metadata.refresh(drop_id) {
            warn!(drop_id, error = %e, "Metadata refresh failed");
        }
        Ok(record)
    }

    fn ensure_idle(&self) -> Result<()> {
        let Some(current) = self.session.state().current_drop.as_deref() else {
            return Ok(());
        };
        match self.machine.get_state(current) {
            Ok(state) if state.is_incomplete() => Err(GtmError::Other(format!(
                "{} is still {}; resume or mark it failed first",
                current, state
            ))),
            _ => Ok(()),
        }
    }

    async fn drive(&mut self, drop_id: &str, cancel: &CancellationToken) -> Result<DropOutcome> {
        let result = self.execute(drop_id, cancel).await;
        if let Err(e) = &result {
            self.record_failure(drop_id, e);
        }
        result
    }

    /// Persist why a drop stopped so it never sits in a transitional state
    fn record_failure(&mut self, drop_id: &str, error: &GtmError) {
        let recorded = match error {
            GtmError::CancellationRequested => self.machine.cancel(drop_id, "cancelled by user"),
            _ => self.machine.fail(drop_id, &error.to_string()),
        };
        if let Err(e) = recorded {
            warn!(drop_id, error = %e, "Could not record drop outcome");
        }
        if let Err(e) = self.session.finish_drop() {
            warn!(drop_id, error = %e, "Could not clear active drop");
        }
    }

    async fn execute(&mut self, drop_id: &str, cancel: &CancellationToken) -> Result<DropOutcome> {
        let drop = self.machine.layout(drop_id)?;
        let store = self.session.store().clone();
        let user_context = match store.read_optional(drop.user_context())? {
            Some(md) => Some(UserContext::from_markdown(&md)?),
            None => self.user_context.clone(),
        };

        let mut state = self.machine.get_state(drop_id)?;
        if state == DropState::Proposed {
            state = self.machine.transition(drop_id, DropState::Researching)?.state;
        }

        if state == DropState::Researching {
            let plan = self.machine.load_plan(drop_id)?;
            let missing = self.machine.missing_assignments(drop_id)?;
            let mission = MissionContext {
                hypothesis: &plan.hypothesis,
                user_context: user_context.as_ref(),
                mode: self.session.mode(),
            };
            let report = self.dispatcher.run(&drop, mission, &missing, cancel).await;
            self.machine.record_assignment_results(
                drop_id,
                &report.failures,
                &report.succeeded_ids(),
            )?;
            if report.was_cancelled() || cancel.is_cancelled() {
                return Err(GtmError::CancellationRequested);
            }
            self.machine.transition(drop_id, DropState::Synthesizing)?;
        }

        let outputs = ResearcherOutput::load_all(&store, &drop)?;
        let synthesis = self
            .synthesis
            .run(
                &store,
                self.session.layout(),
                &drop,
                user_context.as_ref(),
                &outputs,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(GtmError::CancellationRequested);
        }

        let record = self.machine.transition(drop_id, DropState::Complete)?;
        if let Err(e) = self.metadata.refresh(drop_id) {
            warn!(drop_id, error = %e, "Metadata refresh failed");
        }
        // The drop is terminal from here; bookkeeping failures only warn
        if let Err(e) = self.session.finish_drop() {
            warn!(drop_id, error = %e, "Could not clear active drop");
        }
        self.session
            .budget_mut()
            .add(LATEST_DOCUMENT, &synthesis.latest);
        if self.auto_inject {
            if let Err(e) = self.session.inject_drop_context(drop_id) {
                warn!(drop_id, error = %e, "Could not inject drop results into the conversation");
            }
        }

        info!(
            drop_id,
            succeeded = outputs.len(),
            failed = record.failed_assignments.len(),
            "Drop complete"
        );
        Ok(DropOutcome {
            drop_id: drop_id.to_string(),
            state: record.state,
            succeeded: outputs.iter().map(|o| o.researcher_id().to_string()).collect(),
            failed: record.failed_assignments,
            latest: synthesis.latest,
        })
    }
}

/// User context from the most recent drop that captured one
fn restore_user_context(machine: &DropStateMachine) -> Option<UserContext> {
    let drops = match machine.list_drops() {
        Ok(drops) => drops,
        Err(e) => {
            warn!(error = %e, "Could not list drops");
            return None;
        }
    };
    for drop_id in drops.iter().rev() {
        let Ok(layout) = machine.layout(drop_id) else {
            continue;
        };
        match machine.store().read_optional(layout.user_context()) {
            Ok(Some(md)) => match UserContext::from_markdown(&md) {
                Ok(ctx) => return Some(ctx),
                Err(e) => warn!(drop_id = %drop_id, error = %e, "Unreadable user context"),
            },
            Ok(None) => {}
            Err(e) => warn!(drop_id = %drop_id, error = %e, "Unreadable user context"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drop::plan::DEFAULT_TOKEN_BUDGET;
    use crate::drop::ResearcherAssignment;
    use crate::integrations::{ResearchReport, RetryConfig};
    use crate::session::{Message, ResearchMode};
    use crate::storage::{DurableStore, ProjectLayout};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoAgent;

    #[async_trait]
    impl ConversationalAgent for EchoAgent {
        async fn complete(&self, history: &[Message], _directive: &str) -> Result<String> {
            let last = history.last().map(|m| m.content.as_str()).unwrap_or_default();
            Ok(format!("# Document\n\nBased on {} chars", last.len()))
        }
    }

    struct FailingOnMarker;

    #[async_trait]
    impl ResearchEngine for FailingOnMarker {
        async fn research(&self, query: &str, _guidance: &str) -> Result<ResearchReport> {
            if query.contains("broken") {
                return Err(GtmError::Other("engine refused".to_string()));
            }
            Ok(ResearchReport {
                report: format!("Findings on {}", query),
                sources: Vec::new(),
                cost: 0.1,
            })
        }
    }

    fn headquarters(dir: &TempDir) -> Headquarters {
        let store = DurableStore::open(dir.path()).unwrap();
        let project = ProjectLayout::new("acme").unwrap();
        let agent: Arc<dyn ConversationalAgent> = Arc::new(EchoAgent);
        let session =
            ConversationSession::open(store, &project, "s1", ResearchMode::General, agent.clone())
                .unwrap();
        let mut config = FactoryConfig::default();
        config.dispatch.retry = RetryConfig::immediate(0);
        config.dispatch.inject_results = false;
        Headquarters::from_config(&config, session, agent, Arc::new(FailingOnMarker))
    }

    fn plan(drop_id: &str, questions: &[&str]) -> DropPlan {
        DropPlan {
            drop_id: drop_id.to_string(),
            hypothesis: "h".to_string(),
            assignments: questions
                .iter()
                .enumerate()
                .map(|(i, q)| ResearcherAssignment {
                    id: format!("researcher-{}", i + 1),
                    focus_question: q.to_string(),
                    context: None,
                    token_budget: DEFAULT_TOKEN_BUDGET,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_degraded_drop_completes() {
        let dir = TempDir::new().unwrap();
        let mut hq = headquarters(&dir);

        let outcome = hq
            .run_drop(&plan("drop-1", &["pricing", "broken"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, DropState::Complete);
        assert!(outcome.is_degraded());
        assert_eq!(outcome.succeeded, vec!["researcher-1".to_string()]);
        assert!(outcome.latest.contains("drop-1"));
        assert!(hq.session().state().current_drop.is_none());
    }

    #[tokio::test]
    async fn test_injection_failure_keeps_drop_complete() {
        let dir = TempDir::new().unwrap();
        let mut hq = headquarters(&dir);
        hq.set_auto_inject(true);
        let transcript = hq
            .session()
            .store()
            .resolve(hq.session().layout().conversation())
            .unwrap();
        let _ = std::fs::remove_file(&transcript);
        std::fs::create_dir_all(transcript.join("blocked")).unwrap();

        let outcome = hq
            .run_drop(&plan("drop-1", &["pricing"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, DropState::Complete);
        assert_eq!(
            hq.machine().get_state("drop-1").unwrap(),
            DropState::Complete
        );
        assert!(hq.session().state().current_drop.is_none());
    }

    #[test]
    fn test_interrupt_targets_only_running_drop() {
        let interrupts = DropInterrupts::new();
        assert!(!interrupts.interrupt());

        let first = interrupts.begin();
        assert!(interrupts.interrupt());
        assert!(first.is_cancelled());
        assert!(!interrupts.interrupt());

        let second = interrupts.begin();
        assert!(!second.is_cancelled());
        interrupts.end();
        assert!(!interrupts.interrupt());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn test_all_failed_marks_drop_failed() {
        let dir = TempDir::new().unwrap();
        let mut hq = headquarters(&dir);

        let err = hq
            .run_drop(&plan("drop-1", &["broken"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GtmError::EmptyInput(_)));
        let record = hq.machine().load("drop-1").unwrap();
        assert_eq!(record.state, DropState::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let mut hq = headquarters(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = hq.run_drop(&plan("drop-1", &["pricing"]), &cancel).await.unwrap_err();
        assert!(matches!(err, GtmError::CancellationRequested));
        assert_eq!(
            hq.machine().get_state("drop-1").unwrap(),
            DropState::Cancelled
        );
    }

    #[test]
    fn test_mark_failed_frees_session() {
        let dir = TempDir::new().unwrap();
        let mut hq = headquarters(&dir);
        hq.machine().create(&plan("drop-1", &["pricing"])).unwrap();
        hq.session_mut().begin_drop("drop-1").unwrap();
        assert!(hq.ensure_idle().is_err());

        let record = hq.mark_failed("drop-1", "abandoned").unwrap();
        assert_eq!(record.state, DropState::Failed);
        assert_eq!(record.error.as_deref(), Some("abandoned"));
        assert!(hq.ensure_idle().is_ok());
        assert_eq!(
            hq.metadata().read_drop_summary("drop-1").unwrap().state,
            DropState::Failed
        );
    }

    #[tokio::test]
    async fn test_resume_runs_only_missing() {
        let dir = TempDir::new().unwrap();
        let mut hq = headquarters(&dir);
        let plan = plan("drop-1", &["pricing", "channels"]);
        hq.machine().create(&plan).unwrap();
        hq.machine()
            .transition("drop-1", DropState::Researching)
            .unwrap();
        let drop = hq.machine().layout("drop-1").unwrap();
        ResearcherOutput::new("researcher-1", "pricing", "cached", Vec::new(), 0.0, 1.0)
            .persist(hq.session().store(), &drop)
            .unwrap();

        let outcome = hq
            .resume_drop("drop-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        let kept = ResearcherOutput::load(hq.session().store(), &drop, "researcher-1").unwrap();
        assert!(kept.body.contains("cached"));
    }
}
