//! Per-session state persisted in `session-state.json`

use super::mode::ResearchMode;
use crate::storage::layout::{drop_id, drop_number};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub mode: ResearchMode,

    /// Sequence number of the most recently started drop
    #[serde(default)]
    pub drop_counter: u32,

    /// Drop currently being run, if any
    #[serde(default)]
    pub current_drop: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, mode: ResearchMode) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            mode,
            drop_counter: 0,
            current_drop: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Id the next drop will get, without claiming it
    pub fn peek_next_drop_id(&self) -> String {
        drop_id(self.drop_counter + 1)
    }

    /// Mark `id` as started; the counter never moves backwards
    pub fn begin_drop(&mut self, id: &str) {
        if let Some(n) = drop_number(id) {
            self.drop_counter = self.drop_counter.max(n);
        }
        self.current_drop = Some(id.to_string());
        self.updated_at = Utc::now();
    }

    pub fn finish_drop(&mut self) {
        self.current_drop = None;
        self.updated_at = Utc::now();
    }

    /// Whether a drop was in flight when this state was last saved
    pub fn research_in_progress(&self) -> bool {
        self.current_drop.is_some()
    }
}
