//! Store layout: project -> session -> drop
//!
//! ```text
//! <project>/sessions/<session-id>/
//!   conversation-history.md
//!   latest.md
//!   session-metadata.json
//!   session-state.json
//!   drops/drop-<n>/
//!     drop-plan.json  drop-state.json  drop-metadata.json
//!     user-context.md  conversation-history.md  critical-analysis.md
//!     researcher-<id>-output.md  researcher-<id>-meta.json
//! ```

use crate::{GtmError, Result};
use std::path::{Path, PathBuf};

pub const CONVERSATION_FILE: &str = "conversation-history.md";
pub const LATEST_FILE: &str = "latest.md";
pub const SESSION_METADATA_FILE: &str = "session-metadata.json";
pub const SESSION_STATE_FILE: &str = "session-state.json";
pub const DROP_PLAN_FILE: &str = "drop-plan.json";
pub const DROP_STATE_FILE: &str = "drop-state.json";
pub const DROP_METADATA_FILE: &str = "drop-metadata.json";
pub const USER_CONTEXT_FILE: &str = "user-context.md";
pub const CRITICAL_ANALYSIS_FILE: &str = "critical-analysis.md";

/// Glob matching every researcher output in a drop directory
pub const RESEARCHER_OUTPUT_GLOB: &str = "researcher-*-output.md";

/// Reject names that would not stay a single path segment
pub fn validate_segment(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(GtmError::InvalidPath(format!("invalid {} name: {:?}", kind, name)))
    }
}

/// `drop-<n>` for a sequence number
pub fn drop_id(number: u32) -> String {
    format!("drop-{}", number)
}

/// Sequence number of a `drop-<n>` identifier
pub fn drop_number(drop_id: &str) -> Option<u32> {
    drop_id.strip_prefix("drop-")?.parse().ok()
}

/// Top-level namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    name: String,
}

impl ProjectLayout {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment("project", &name)?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sessions_dir(&self) -> PathBuf {
        Path::new(&self.name).join("sessions")
    }

    pub fn session(&self, session_id: &str) -> Result<SessionLayout> {
        validate_segment("session", session_id)?;
        Ok(SessionLayout {
            project: self.name.clone(),
            session_id: session_id.to_string(),
            base: self.sessions_dir().join(session_id),
        })
    }
}

/// Paths of one session's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    project: String,
    session_id: String,
    base: PathBuf,
}

impl SessionLayout {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn conversation(&self) -> PathBuf {
        self.base.join(CONVERSATION_FILE)
    }

    pub fn latest(&self) -> PathBuf {
        self.base.join(LATEST_FILE)
    }

    pub fn metadata(&self) -> PathBuf {
        self.base.join(SESSION_METADATA_FILE)
    }

    pub fn state(&self) -> PathBuf {
        self.base.join(SESSION_STATE_FILE)
    }

    pub fn drops_dir(&self) -> PathBuf {
        self.base.join("drops")
    }

    pub fn drop(&self, drop_id: &str) -> Result<DropLayout> {
        validate_segment("drop", drop_id)?;
        Ok(DropLayout {
            drop_id: drop_id.to_string(),
            base: self.drops_dir().join(drop_id),
        })
    }
}

/// Paths of one drop's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropLayout {
    drop_id: String,
    base: PathBuf,
}

impl DropLayout {
    pub fn drop_id(&self) -> &str {
        &self.drop_id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn plan(&self) -> PathBuf {
        self.base.join(DROP_PLAN_FILE)
    }

    pub fn state(&self) -> PathBuf {
        self.base.join(DROP_STATE_FILE)
    }

    pub fn metadata(&self) -> PathBuf {
        self.base.join(DROP_METADATA_FILE)
    }

    pub fn user_context(&self) -> PathBuf {
        self.base.join(USER_CONTEXT_FILE)
    }

    pub fn conversation(&self) -> PathBuf {
        self.base.join(CONVERSATION_FILE)
    }

    pub fn critical_analysis(&self) -> PathBuf {
        self.base.join(CRITICAL_ANALYSIS_FILE)
    }

    /// `researcher-<id>-output.md`; ids already carry the `researcher-` prefix
    pub fn researcher_output(&self, researcher_id: &str) -> PathBuf {
        self.base.join(format!("{}-output.md", researcher_id))
    }

    pub fn researcher_meta(&self, researcher_id: &str) -> PathBuf {
        self.base.join(format!("{}-meta.json", researcher_id))
    }
}

/// Researcher id encoded in an output file name
pub fn researcher_id_from_output(file_name: &str) -> Option<&str> {
    let id = file_name.strip_suffix("-output.md")?;
    id.starts_with("researcher-").then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let session = ProjectLayout::new("acme").unwrap().session("s1").unwrap();
        assert_eq!(session.latest(), PathBuf::from("acme/sessions/s1/latest.md"));

        let drop = session.drop("drop-2").unwrap();
        assert_eq!(
            drop.researcher_output("researcher-1"),
            PathBuf::from("acme/sessions/s1/drops/drop-2/researcher-1-output.md")
        );
        assert_eq!(drop.drop_id(), "drop-2");
    }

    #[test]
    fn test_segment_validation() {
        assert!(ProjectLayout::new("../x").is_err());
        assert!(ProjectLayout::new("").is_err());
        assert!(ProjectLayout::new(".hidden").is_err());
        let project = ProjectLayout::new("acme").unwrap();
        assert!(project.session("a/b").is_err());
    }

    #[test]
    fn test_drop_ids() {
        assert_eq!(drop_id(3), "drop-3");
        assert_eq!(drop_number("drop-12"), Some(12));
        assert_eq!(drop_number("drop-x"), None);
        assert_eq!(drop_number("other"), None);
    }

    #[test]
    fn test_researcher_id_from_output() {
        assert_eq!(
            researcher_id_from_output("researcher-2-output.md"),
            Some("researcher-2")
        );
        assert_eq!(researcher_id_from_output("notes-output.md"), None);
        assert_eq!(researcher_id_from_output("researcher-2-meta.json"), None);
    }
}
