//! Canonical drop plan
//!
//! Agents describe a plan in one of several loose JSON shapes. This module
//! normalizes them once, at the extraction boundary, into [`DropPlan`].

use crate::session::extract_json_object;
use crate::{GtmError, Result};
use serde::{Deserialize, Serialize};

/// Agents answer with this marker instead of a plan when they need more input
pub const CLARIFICATION_MARKER: &str = "NEEDS_CLARIFICATION";

pub const DEFAULT_TOKEN_BUDGET: u32 = 4000;
pub const MAX_ASSIGNMENTS: usize = 4;

const RESEARCHER_PREFIX: &str = "researcher-";

/// One unit of research work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearcherAssignment {
    pub id: String,
    pub focus_question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default = "default_token_budget")]
    pub token_budget: u32,
}

fn default_token_budget() -> u32 {
    DEFAULT_TOKEN_BUDGET
}

/// A batch of research assignments sharing one hypothesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPlan {
    pub drop_id: String,
    pub hypothesis: String,
    pub assignments: Vec<ResearcherAssignment>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    hypothesis: Option<String>,
    #[serde(alias = "researchers")]
    researchers_assigned: Option<Vec<RawAssignment>>,
}

#[derive(Debug, Deserialize)]
struct RawAssignment {
    id: Option<String>,
    #[serde(alias = "focus")]
    focus_question: Option<String>,
    context: Option<String>,
    token_budget: Option<u32>,
}

impl DropPlan {
    /// Parse an agent's plan proposal
    ///
    /// Returns `Ok(None)` when the agent asked for clarification or produced
    /// no JSON object at all. A JSON object that does not describe a usable
    /// plan is [`GtmError::MalformedExtraction`].
    pub fn from_extraction(text: &str, drop_id: &str) -> Result<Option<Self>> {
        if text.contains(CLARIFICATION_MARKER) {
            return Ok(None);
        }
        let Some(json) = extract_json_object(text) else {
            return Ok(None);
        };
        let raw: RawPlan = match serde_json::from_str(json) {
            Ok(raw) => raw,
            Err(e) if e.is_syntax() || e.is_eof() => return Ok(None),
            Err(e) => return Err(GtmError::MalformedExtraction(e.to_string())),
        };

        let hypothesis = raw
            .hypothesis
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GtmError::MalformedExtraction("plan has no hypothesis".to_string()))?;

        let raw_assignments = raw.researchers_assigned.unwrap_or_default();
        if raw_assignments.is_empty() || raw_assignments.len() > MAX_ASSIGNMENTS {
            return Err(GtmError::MalformedExtraction(format!(
                "plan must have 1-{} assignments, got {}",
                MAX_ASSIGNMENTS,
                raw_assignments.len()
            )));
        }

        let mut assignments = Vec::with_capacity(raw_assignments.len());
        for (idx, raw) in raw_assignments.into_iter().enumerate() {
            let focus_question = raw
                .focus_question
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .ok_or_else(|| {
                    GtmError::MalformedExtraction(format!(
                        "assignment {} has no focus question",
                        idx + 1
                    ))
                })?;
            assignments.push(ResearcherAssignment {
                id: raw.id.unwrap_or_default(),
                focus_question,
                context: raw.context.filter(|c| !c.trim().is_empty()),
                token_budget: raw.token_budget.unwrap_or(DEFAULT_TOKEN_BUDGET),
            });
        }
        assign_researcher_ids(&mut assignments);

        Ok(Some(Self {
            drop_id: drop_id.to_string(),
            hypothesis,
            assignments,
        }))
    }

    pub fn assignment(&self, researcher_id: &str) -> Option<&ResearcherAssignment> {
        self.assignments.iter().find(|a| a.id == researcher_id)
    }
}

/// Give every assignment a unique `researcher-` id
///
/// Blank ids become `researcher-<position>`; explicit ids are lowercased,
/// reduced to `[a-z0-9-]` and prefixed. Running it again on its own output
/// changes nothing.
pub fn assign_researcher_ids(assignments: &mut [ResearcherAssignment]) {
    let mut taken: Vec<String> = Vec::with_capacity(assignments.len());
    for (idx, assignment) in assignments.iter_mut().enumerate() {
        let mut id = normalize_researcher_id(&assignment.id)
            .unwrap_or_else(|| format!("{}{}", RESEARCHER_PREFIX, idx + 1));
        if taken.contains(&id) {
            id = format!("{}-{}", id, idx + 1);
        }
        taken.push(id.clone());
        assignment.id = id;
    }
}

fn normalize_researcher_id(raw: &str) -> Option<String> {
    let mut cleaned = String::with_capacity(raw.len());
    for c in raw.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            cleaned.push(c);
        } else if !cleaned.ends_with('-') {
            cleaned.push('-');
        }
    }
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.starts_with(RESEARCHER_PREFIX) && cleaned.len() > RESEARCHER_PREFIX.len() {
        Some(cleaned.to_string())
    } else {
        Some(format!("{}{}", RESEARCHER_PREFIX, cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(id: &str) -> ResearcherAssignment {
        ResearcherAssignment {
            id: id.to_string(),
            focus_question: "q".to_string(),
            context: None,
            token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }

    #[test]
    fn test_clarification_marker() {
        let plan = DropPlan::from_extraction("NEEDS_CLARIFICATION: who buys?", "drop-1").unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_no_json_is_none() {
        assert!(DropPlan::from_extraction("Let's talk more first.", "drop-1")
            .unwrap()
            .is_none());
        assert!(DropPlan::from_extraction("{ broken json", "drop-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_both_shapes_normalize() {
        let a = r#"Plan: {"hypothesis": "H", "researchers_assigned": [
            {"focus_question": "Who buys?", "token_budget": 3000}]}"#;
        let b = r#"{"hypothesis": "H", "researchers": [{"focus": "Who buys?", "token_budget": 3000}]}"#;

        let a = DropPlan::from_extraction(a, "drop-1").unwrap().unwrap();
        let b = DropPlan::from_extraction(b, "drop-1").unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.assignments[0].id, "researcher-1");
        assert_eq!(a.assignments[0].token_budget, 3000);
    }

    #[test]
    fn test_defaults() {
        let text = r#"{"hypothesis": "H", "researchers": [{"focus": "A"}, {"focus": "B", "context": "mid-market"}]}"#;
        let plan = DropPlan::from_extraction(text, "drop-4").unwrap().unwrap();
        assert_eq!(plan.drop_id, "drop-4");
        assert_eq!(plan.assignments.len(), 2);
        assert_eq!(plan.assignments[1].id, "researcher-2");
        assert_eq!(plan.assignments[1].context.as_deref(), Some("mid-market"));
        assert_eq!(plan.assignments[0].token_budget, DEFAULT_TOKEN_BUDGET);
    }

    #[test]
    fn test_invalid_plans_are_malformed() {
        let too_many = r#"{"hypothesis": "H", "researchers": [
            {"focus": "1"}, {"focus": "2"}, {"focus": "3"}, {"focus": "4"}, {"focus": "5"}]}"#;
        let none = r#"{"hypothesis": "H", "researchers": []}"#;
        let no_focus = r#"{"hypothesis": "H", "researchers": [{"context": "x"}]}"#;
        let no_hypothesis = r#"{"researchers": [{"focus": "x"}]}"#;

        for text in [too_many, none, no_focus, no_hypothesis] {
            assert!(matches!(
                DropPlan::from_extraction(text, "drop-1"),
                Err(GtmError::MalformedExtraction(_))
            ));
        }
    }

    #[test]
    fn test_id_assignment_is_idempotent() {
        let mut list = vec![
            assignment(""),
            assignment("Pricing Analyst"),
            assignment("researcher-3"),
            assignment("pricing analyst"),
        ];
        assign_researcher_ids(&mut list);
        let first: Vec<String> = list.iter().map(|a| a.id.clone()).collect();
        assert_eq!(
            first,
            vec![
                "researcher-1",
                "researcher-pricing-analyst",
                "researcher-3",
                "researcher-pricing-analyst-4",
            ]
        );

        assign_researcher_ids(&mut list);
        let second: Vec<String> = list.iter().map(|a| a.id.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_same_input_same_ids() {
        let mut a = vec![assignment(""), assignment("")];
        let mut b = a.clone();
        assign_researcher_ids(&mut a);
        assign_researcher_ids(&mut b);
        assert_eq!(a, b);
        assert_ne!(a[0].id, a[1].id);
    }
}
