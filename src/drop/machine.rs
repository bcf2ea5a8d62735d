//! Persistent drop state machine
//!
//! Every transition is written to `drop-state.json` before the call returns,
//! so a restart always sees the last state the drop actually reached.

use super::plan::{DropPlan, ResearcherAssignment};
use super::state::{DropState, DropStateRecord, FailedAssignment};
use crate::storage::layout::drop_number;
use crate::storage::{DropLayout, DurableStore, SessionLayout};
use crate::{GtmError, Result};
use chrono::Utc;
use tracing::{info, warn};

/// Drop lifecycle for one session
#[derive(Debug, Clone)]
pub struct DropStateMachine {
    store: DurableStore,
    session: SessionLayout,
}

impl DropStateMachine {
    pub fn new(store: DurableStore, session: SessionLayout) -> Self {
        Self { store, session }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn session(&self) -> &SessionLayout {
        &self.session
    }

    pub fn layout(&self, drop_id: &str) -> Result<DropLayout> {
        self.session.drop(drop_id)
    }

    /// Persist the plan and a `proposed` record for a new drop
    pub fn create(&self, plan: &DropPlan) -> Result<DropStateRecord> {
        let layout = self.layout(&plan.drop_id)?;
        if self.store.exists(layout.state()) {
            return Err(GtmError::DropExists(plan.drop_id.clone()));
        }

        // Plan first: a state record never exists without its assignments
        self.store.write_json(layout.plan(), plan)?;
        let record = DropStateRecord::new(&plan.drop_id);
        self.store.write_json(layout.state(), &record)?;

        info!(
            drop_id = %plan.drop_id,
            assignments = plan.assignments.len(),
            "Drop proposed"
        );
        Ok(record)
    }

    pub fn load(&self, drop_id: &str) -> Result<DropStateRecord> {
        self.store.read_json(self.layout(drop_id)?.state())
    }

    pub fn get_state(&self, drop_id: &str) -> Result<DropState> {
        Ok(self.load(drop_id)?.state)
    }

    pub fn load_plan(&self, drop_id: &str) -> Result<DropPlan> {
        self.store.read_json(self.layout(drop_id)?.plan())
    }

    /// Move a drop to `next`, persisting the new record
    pub fn transition(&self, drop_id: &str, next: DropState) -> Result<DropStateRecord> {
        self.update(drop_id, next, |_| {})
    }

    /// Record a definitive error; the drop becomes `failed`
    pub fn fail(&self, drop_id: &str, reason: &str) -> Result<DropStateRecord> {
        let record = self.update(drop_id, DropState::Failed, |r| {
            r.error = Some(reason.to_string());
        })?;
        warn!(drop_id, reason, "Drop failed");
        Ok(record)
    }

    /// Record an operator stop; the drop becomes `cancelled`
    pub fn cancel(&self, drop_id: &str, reason: &str) -> Result<DropStateRecord> {
        let record = self.update(drop_id, DropState::Cancelled, |r| {
            r.error = Some(reason.to_string());
        })?;
        warn!(drop_id, reason, "Drop cancelled");
        Ok(record)
    }

    /// Merge assignment failures into a drop that is still in progress
    ///
    /// A later success for the same researcher clears its failure.
    pub fn record_assignment_results(
        &self,
        drop_id: &str,
        failures: &[FailedAssignment],
        succeeded: &[String],
    ) -> Result<DropStateRecord> {
        let mut record = self.load(drop_id)?;
        if record.state.is_terminal() {
            return Err(GtmError::InvalidTransition {
                drop_id: drop_id.to_string(),
                from: record.state,
                to: record.state,
            });
        }

        record
            .failed_assignments
            .retain(|f| !succeeded.contains(&f.researcher_id));
        for failure in failures {
            record
                .failed_assignments
                .retain(|f| f.researcher_id != failure.researcher_id);
            record.failed_assignments.push(failure.clone());
        }
        record.updated_at = Utc::now();
        self.store.write_json(self.layout(drop_id)?.state(), &record)?;
        Ok(record)
    }

    fn update(
        &self,
        drop_id: &str,
        next: DropState,
        mutate: impl FnOnce(&mut DropStateRecord),
    ) -> Result<DropStateRecord> {
        let layout = self.layout(drop_id)?;
        let mut record: DropStateRecord = self.store.read_json(layout.state())?;
        if !record.state.can_transition_to(next) {
            return Err(GtmError::InvalidTransition {
                drop_id: drop_id.to_string(),
                from: record.state,
                to: next,
            });
        }

        let from = record.state;
        record.state = next;
        record.updated_at = Utc::now();
        mutate(&mut record);
        self.store.write_json(layout.state(), &record)?;

        info!(drop_id, from = %from, to = %next, "Drop transition");
        Ok(record)
    }

    /// Drop ids in this session, in sequence order
    pub fn list_drops(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .store
            .list_dirs(self.session.drops_dir())?
            .into_iter()
            .filter(|name| drop_number(name).is_some())
            .collect();
        ids.sort_by_key(|id| drop_number(id));
        Ok(ids)
    }

    /// Highest drop sequence number present on disk
    pub fn highest_drop_number(&self) -> Result<u32> {
        Ok(self
            .list_drops()?
            .iter()
            .filter_map(|id| drop_number(id))
            .max()
            .unwrap_or(0))
    }

    /// Every drop whose persisted state is `proposed`, `researching` or `synthesizing`
    ///
    /// Drop directories without a readable state record are skipped with a warning.
    pub fn find_incomplete(&self) -> Result<Vec<DropStateRecord>> {
        let mut incomplete = Vec::new();
        for drop_id in self.list_drops()? {
            match self.load(&drop_id) {
                Ok(record) if record.state.is_incomplete() => incomplete.push(record),
                Ok(_) => {}
                Err(e) => warn!(drop_id = %drop_id, error = %e, "Skipping unreadable drop"),
            }
        }
        Ok(incomplete)
    }

    /// Planned assignments with no persisted output yet
    pub fn missing_assignments(&self, drop_id: &str) -> Result<Vec<ResearcherAssignment>> {
        let layout = self.layout(drop_id)?;
        let plan = self.load_plan(drop_id)?;
        Ok(plan
            .assignments
            .into_iter()
            .filter(|a| !self.store.exists(layout.researcher_output(&a.id)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drop::plan::DEFAULT_TOKEN_BUDGET;
    use crate::storage::ProjectLayout;
    use tempfile::TempDir;

    fn machine() -> (TempDir, DropStateMachine) {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let session = ProjectLayout::new("acme").unwrap().session("s1").unwrap();
        (dir, DropStateMachine::new(store, session))
    }

    fn plan(drop_id: &str, n: usize) -> DropPlan {
        DropPlan {
            drop_id: drop_id.to_string(),
            hypothesis: "Mid-market buyers churn on onboarding".to_string(),
            assignments: (1..=n)
                .map(|i| ResearcherAssignment {
                    id: format!("researcher-{}", i),
                    focus_question: format!("question {}", i),
                    context: None,
                    token_budget: DEFAULT_TOKEN_BUDGET,
                })
                .collect(),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let (_dir, m) = machine();
        m.create(&plan("drop-1", 2)).unwrap();
        assert_eq!(m.get_state("drop-1").unwrap(), DropState::Proposed);

        m.transition("drop-1", DropState::Researching).unwrap();
        m.transition("drop-1", DropState::Synthesizing).unwrap();
        let record = m.transition("drop-1", DropState::Complete).unwrap();
        assert_eq!(record.state, DropState::Complete);
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_rejects_skips_and_terminal_changes() {
        let (_dir, m) = machine();
        m.create(&plan("drop-1", 1)).unwrap();
        assert!(matches!(
            m.transition("drop-1", DropState::Complete),
            Err(GtmError::InvalidTransition { .. })
        ));

        m.fail("drop-1", "engine down").unwrap();
        assert!(matches!(
            m.transition("drop-1", DropState::Researching),
            Err(GtmError::InvalidTransition { .. })
        ));
        assert!(m.cancel("drop-1", "stop").is_err());
        let record = m.load("drop-1").unwrap();
        assert_eq!(record.state, DropState::Failed);
        assert_eq!(record.error.as_deref(), Some("engine down"));
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let (_dir, m) = machine();
        m.create(&plan("drop-1", 1)).unwrap();
        assert!(matches!(
            m.create(&plan("drop-1", 1)),
            Err(GtmError::DropExists(_))
        ));
    }

    #[test]
    fn test_missing_drop_is_not_found() {
        let (_dir, m) = machine();
        assert!(m.get_state("drop-9").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_drops_numeric_order() {
        let (_dir, m) = machine();
        for id in ["drop-10", "drop-2", "drop-1"] {
            m.create(&plan(id, 1)).unwrap();
        }
        assert_eq!(m.list_drops().unwrap(), vec!["drop-1", "drop-2", "drop-10"]);
        assert_eq!(m.highest_drop_number().unwrap(), 10);
    }

    #[test]
    fn test_missing_assignments() {
        let (_dir, m) = machine();
        m.create(&plan("drop-1", 3)).unwrap();
        let layout = m.layout("drop-1").unwrap();
        m.store()
            .write(layout.researcher_output("researcher-2"), "# findings")
            .unwrap();

        let missing: Vec<String> = m
            .missing_assignments("drop-1")
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(missing, vec!["researcher-1", "researcher-3"]);
    }

    #[test]
    fn test_assignment_results_merge() {
        let (_dir, m) = machine();
        m.create(&plan("drop-1", 2)).unwrap();
        let failure = FailedAssignment {
            researcher_id: "researcher-2".to_string(),
            reason: "timeout".to_string(),
        };
        m.record_assignment_results("drop-1", &[failure.clone()], &[])
            .unwrap();
        let record = m
            .record_assignment_results("drop-1", &[failure], &[])
            .unwrap();
        assert_eq!(record.failed_assignments.len(), 1);

        let record = m
            .record_assignment_results("drop-1", &[], &["researcher-2".to_string()])
            .unwrap();
        assert!(record.failed_assignments.is_empty());
    }
}
