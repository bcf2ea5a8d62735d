//! Research dispatcher
//!
//! Runs every assignment of a drop concurrently on the current task. Each
//! assignment writes only its own output files, so no locking is needed
//! around the store. One assignment failing never stops its siblings.

use super::mission::{build_guidance, MissionContext, TARGET_TOKENS_MAX, TARGET_TOKENS_MIN};
use super::output::ResearcherOutput;
use super::status::{DispatchEvent, ResearcherStatus};
use crate::drop::{FailedAssignment, ResearcherAssignment};
use crate::integrations::{with_retry_cancellable, ResearchEngine, RetryConfig};
use crate::storage::{DropLayout, DurableStore};
use crate::{GtmError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type EventListeners = Arc<RwLock<Vec<Box<dyn Fn(&DispatchEvent) + Send + Sync>>>>;

/// Outcome of one dispatch run
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outputs: Vec<ResearcherOutput>,
    pub failures: Vec<FailedAssignment>,
    pub cancelled: Vec<String>,
}

impl DispatchReport {
    pub fn succeeded_ids(&self) -> Vec<String> {
        self.outputs
            .iter()
            .map(|o| o.researcher_id().to_string())
            .collect()
    }

    pub fn was_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }
}

enum Outcome {
    Done(ResearcherOutput),
    Failed(FailedAssignment),
    Cancelled(String),
}

/// Fans a drop's assignments out to the research engine
pub struct ResearchDispatcher {
    engine: Arc<dyn ResearchEngine>,
    store: DurableStore,
    retry: RetryConfig,
    skip_existing: bool,
    statuses: Arc<RwLock<HashMap<String, ResearcherStatus>>>,
    listeners: EventListeners,
}

impl ResearchDispatcher {
    pub fn new(engine: Arc<dyn ResearchEngine>, store: DurableStore) -> Self {
        Self {
            engine,
            store,
            retry: RetryConfig::for_research(),
            skip_existing: true,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Reuse outputs already on disk instead of re-running their assignments
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    fn emit(&self, event: DispatchEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Current status of every assignment in the last or running dispatch
    pub fn statuses(&self) -> HashMap<String, ResearcherStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self, researcher_id: &str) -> Option<ResearcherStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(researcher_id)
            .copied()
    }

    fn set_status(&self, researcher_id: &str, new_status: ResearcherStatus) {
        let old_status = {
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            statuses
                .insert(researcher_id.to_string(), new_status)
                .unwrap_or(ResearcherStatus::Idle)
        };
        if old_status != new_status {
            debug!(researcher_id, from = %old_status, to = %new_status, "Researcher status");
            self.emit(DispatchEvent::StatusChanged {
                researcher_id: researcher_id.to_string(),
                old_status,
                new_status,
            });
        }
    }

    /// Run `assignments` for `drop`, returning once every one has finished
    pub async fn run(
        &self,
        drop: &DropLayout,
        mission: MissionContext<'_>,
        assignments: &[ResearcherAssignment],
        cancel: &CancellationToken,
    ) -> DispatchReport {
        {
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            statuses.clear();
            for assignment in assignments {
                statuses.insert(assignment.id.clone(), ResearcherStatus::Idle);
            }
        }
        info!(
            drop_id = drop.drop_id(),
            assignments = assignments.len(),
            "Dispatching research"
        );

        let outcomes = join_all(
            assignments
                .iter()
                .map(|assignment| self.run_one(drop, &mission, assignment, cancel)),
        )
        .await;

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Done(output) => report.outputs.push(output),
                Outcome::Failed(failure) => report.failures.push(failure),
                Outcome::Cancelled(id) => report.cancelled.push(id),
            }
        }
        info!(
            drop_id = drop.drop_id(),
            succeeded = report.outputs.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled.len(),
            "Dispatch finished"
        );
        report
    }

    async fn run_one(
        &self,
        drop: &DropLayout,
        mission: &MissionContext<'_>,
        assignment: &ResearcherAssignment,
        cancel: &CancellationToken,
    ) -> Outcome {
        let id = assignment.id.as_str();

        if self.skip_existing && self.store.exists(drop.researcher_output(id)) {
            match ResearcherOutput::load(&self.store, drop, id) {
                Ok(output) => {
                    debug!(researcher_id = id, "Reusing persisted output");
                    self.set_status(id, ResearcherStatus::Complete);
                    return Outcome::Done(output);
                }
                Err(e) => warn!(researcher_id = id, error = %e, "Persisted output unreadable, re-running"),
            }
        }

        match self.research(drop, mission, assignment, cancel).await {
            Ok(output) => {
                self.set_status(id, ResearcherStatus::Complete);
                self.emit(DispatchEvent::Completed {
                    researcher_id: id.to_string(),
                    token_count: output.meta.token_count,
                    cost: output.meta.cost,
                });
                Outcome::Done(output)
            }
            Err(GtmError::CancellationRequested) => {
                self.set_status(id, ResearcherStatus::Cancelled);
                self.emit(DispatchEvent::Cancelled(id.to_string()));
                Outcome::Cancelled(id.to_string())
            }
            Err(e) => {
                let reason = match e {
                    GtmError::AssignmentFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(researcher_id = id, reason = %reason, "Assignment failed");
                self.set_status(id, ResearcherStatus::Failed);
                self.emit(DispatchEvent::Failed {
                    researcher_id: id.to_string(),
                    reason: reason.clone(),
                });
                Outcome::Failed(FailedAssignment {
                    researcher_id: id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn research(
        &self,
        drop: &DropLayout,
        mission: &MissionContext<'_>,
        assignment: &ResearcherAssignment,
        cancel: &CancellationToken,
    ) -> Result<ResearcherOutput> {
        let id = assignment.id.as_str();
        if cancel.is_cancelled() {
            return Err(GtmError::CancellationRequested);
        }

        self.set_status(id, ResearcherStatus::Searching);
        let guidance = build_guidance(mission, assignment);
        let started = Instant::now();

        let engine = &self.engine;
        let query = assignment.focus_question.as_str();
        let guidance = guidance.as_str();
        let report = with_retry_cancellable(
            &self.retry,
            &format!("research.{}", id),
            cancel,
            move || async move { engine.research(query, guidance).await },
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(GtmError::CancellationRequested);
        }

        self.set_status(id, ResearcherStatus::Analyzing);
        let output = ResearcherOutput::new(
            id,
            &assignment.focus_question,
            &report.report,
            report.sources,
            report.cost,
            started.elapsed().as_secs_f64(),
        );
        if !(TARGET_TOKENS_MIN..=TARGET_TOKENS_MAX).contains(&output.meta.token_count) {
            debug!(
                researcher_id = id,
                tokens = output.meta.token_count,
                "Output outside target length"
            );
        }

        self.set_status(id, ResearcherStatus::Writing);
        output
            .persist(&self.store, drop)
            .map_err(|e| GtmError::AssignmentFailure {
                researcher_id: id.to_string(),
                reason: format!("could not persist output: {}", e),
            })?;

        info!(
            researcher_id = id,
            tokens = output.meta.token_count,
            sources = output.meta.sources.len(),
            runtime_secs = output.meta.runtime_seconds,
            "Research complete"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drop::plan::DEFAULT_TOKEN_BUDGET;
    use crate::integrations::{ResearchReport, Source};
    use crate::session::ResearchMode;
    use crate::storage::ProjectLayout;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Fails any query containing "fail"; counts calls
    struct ScriptedEngine {
        calls: AtomicUsize,
        transient_failures: AtomicUsize,
    }

    #[async_trait]
    impl ResearchEngine for ScriptedEngine {
        async fn research(&self, query: &str, _guidance: &str) -> Result<ResearchReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.contains("fail") {
                return Err(GtmError::Other(format!("engine rejected: {}", query)));
            }
            if query.contains("flaky")
                && self.transient_failures.fetch_add(1, Ordering::SeqCst) < 1
            {
                return Err(GtmError::Research("503".to_string()));
            }
            Ok(ResearchReport {
                report: format!("Findings for {}", query),
                sources: vec![Source {
                    url: "https://example.com".to_string(),
                    title: None,
                }],
                cost: 0.02,
            })
        }
    }

    fn engine() -> Arc<ScriptedEngine> {
        Arc::new(ScriptedEngine {
            calls: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
        })
    }

    fn assignment(id: &str, question: &str) -> ResearcherAssignment {
        ResearcherAssignment {
            id: id.to_string(),
            focus_question: question.to_string(),
            context: None,
            token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }

    fn setup() -> (TempDir, DurableStore, DropLayout) {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let drop = ProjectLayout::new("acme")
            .unwrap()
            .session("s1")
            .unwrap()
            .drop("drop-1")
            .unwrap();
        (dir, store, drop)
    }

    fn mission() -> MissionContext<'static> {
        MissionContext {
            hypothesis: "h",
            user_context: None,
            mode: ResearchMode::General,
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let (_dir, store, drop) = setup();
        let dispatcher = ResearchDispatcher::new(engine(), store.clone())
            .with_retry(RetryConfig::immediate(2));

        let assignments = vec![
            assignment("researcher-1", "who buys"),
            assignment("researcher-2", "please fail"),
            assignment("researcher-3", "what price"),
        ];
        let report = dispatcher
            .run(&drop, mission(), &assignments, &CancellationToken::new())
            .await;

        assert_eq!(report.outputs.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].researcher_id, "researcher-2");
        assert!(store.exists(drop.researcher_output("researcher-1")));
        assert!(store.exists(drop.researcher_output("researcher-3")));
        assert!(!store.exists(drop.researcher_output("researcher-2")));
        assert_eq!(
            dispatcher.status("researcher-2"),
            Some(ResearcherStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (_dir, store, drop) = setup();
        let engine = engine();
        let dispatcher = ResearchDispatcher::new(engine.clone(), store)
            .with_retry(RetryConfig::immediate(2));

        let report = dispatcher
            .run(
                &drop,
                mission(),
                &[assignment("researcher-1", "flaky market")],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.outputs.len(), 1);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, store, drop) = setup();
        let engine = engine();
        let dispatcher = ResearchDispatcher::new(engine.clone(), store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher
            .run(&drop, mission(), &[assignment("researcher-1", "q")], &cancel)
            .await;

        assert!(report.was_cancelled());
        assert!(report.outputs.is_empty());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            dispatcher.status("researcher-1"),
            Some(ResearcherStatus::Cancelled)
        );
    }

    /// "fast" answers at once; "slow" waits for it, then cancels the drop
    struct CancellingEngine {
        cancel: CancellationToken,
        fast_done: tokio::sync::Notify,
    }

    #[async_trait]
    impl ResearchEngine for CancellingEngine {
        async fn research(&self, query: &str, _guidance: &str) -> Result<ResearchReport> {
            if query.contains("slow") {
                self.fast_done.notified().await;
                self.cancel.cancel();
            } else {
                self.fast_done.notify_one();
            }
            Ok(ResearchReport {
                report: format!("Findings for {}", query),
                sources: Vec::new(),
                cost: 0.01,
            })
        }
    }

    #[tokio::test]
    async fn test_cancelled_mid_batch_keeps_finished_output() {
        let (_dir, store, drop) = setup();
        let cancel = CancellationToken::new();
        let engine = Arc::new(CancellingEngine {
            cancel: cancel.clone(),
            fast_done: tokio::sync::Notify::new(),
        });
        let dispatcher = ResearchDispatcher::new(engine, store.clone());

        let assignments = vec![
            assignment("researcher-1", "fast question"),
            assignment("researcher-2", "slow question"),
        ];
        let report = dispatcher.run(&drop, mission(), &assignments, &cancel).await;

        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].researcher_id(), "researcher-1");
        assert_eq!(report.cancelled, vec!["researcher-2".to_string()]);
        assert!(report.failures.is_empty());
        assert!(store.exists(drop.researcher_output("researcher-1")));
        assert!(!store.exists(drop.researcher_output("researcher-2")));
        assert_eq!(
            dispatcher.status("researcher-2"),
            Some(ResearcherStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_existing_outputs_are_reused() {
        let (_dir, store, drop) = setup();
        ResearcherOutput::new("researcher-1", "q", "earlier run", Vec::new(), 0.1, 1.0)
            .persist(&store, &drop)
            .unwrap();
        let engine = engine();
        let dispatcher = ResearchDispatcher::new(engine.clone(), store);

        let report = dispatcher
            .run(
                &drop,
                mission(),
                &[assignment("researcher-1", "q"), assignment("researcher-2", "r")],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.outputs.len(), 2);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(report.outputs[0].body.contains("earlier run"));
    }

    #[tokio::test]
    async fn test_events_reach_listeners() {
        let (_dir, store, drop) = setup();
        let dispatcher = ResearchDispatcher::new(engine(), store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.add_listener(move |event| {
            if let DispatchEvent::StatusChanged { new_status, .. } = event {
                sink.lock().unwrap().push(*new_status);
            }
        });

        dispatcher
            .run(
                &drop,
                mission(),
                &[assignment("researcher-1", "q")],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ResearcherStatus::Searching,
                ResearcherStatus::Analyzing,
                ResearcherStatus::Writing,
                ResearcherStatus::Complete,
            ]
        );
    }
}
