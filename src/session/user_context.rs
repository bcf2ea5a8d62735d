//! User Context: the strategic intent extracted from a conversation
//!
//! Extraction is strict: the agent's JSON must carry every required field or
//! the whole extraction fails with [`GtmError::MalformedExtraction`]. The
//! persisted form is markdown, readable by people and by later agents, and it
//! parses back to the same value.

use super::extract::extract_json_object;
use crate::{GtmError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priorities {
    pub must_have: Vec<String>,
    pub nice_to_have: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub strategic_why: String,
    pub decision_context: String,
    pub mental_models: Vec<String>,
    pub priorities: Priorities,
    pub constraints: Vec<String>,
    pub success_criteria: String,
    pub hypothesis: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

/// Exact schema the agent must answer with
#[derive(Debug, Deserialize)]
struct ExtractedContext {
    strategic_why: String,
    decision_context: String,
    mental_models: Vec<String>,
    priorities: Priorities,
    constraints: Vec<String>,
    success_criteria: String,
    #[serde(default)]
    hypothesis: Option<String>,
}

const TITLE: &str = "# User Context";
const WHY: &str = "## Strategic WHY";
const DECISION: &str = "## Decision Context";
const SUCCESS: &str = "## Success Criteria";
const MODELS: &str = "## Mental Models";
const PRIORITIES: &str = "## Priorities";
const MUST: &str = "### Must Have";
const NICE: &str = "### Nice to Have";
const CONSTRAINTS: &str = "## Constraints";
const HYPOTHESIS: &str = "## Hypothesis";
const EXTRACTED: &str = "_Extracted: ";

impl UserContext {
    /// Parse an agent's extraction answer
    pub fn from_extraction(text: &str) -> Result<Self> {
        let json = extract_json_object(text).ok_or_else(|| {
            GtmError::MalformedExtraction("no JSON object in agent response".to_string())
        })?;
        let raw: ExtractedContext = serde_json::from_str(json)
            .map_err(|e| GtmError::MalformedExtraction(e.to_string()))?;

        let required = [
            ("strategic_why", &raw.strategic_why),
            ("decision_context", &raw.decision_context),
            ("success_criteria", &raw.success_criteria),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(GtmError::MalformedExtraction(format!(
                    "field `{}` is empty",
                    field
                )));
            }
        }

        Ok(Self {
            strategic_why: clean_text(&raw.strategic_why),
            decision_context: clean_text(&raw.decision_context),
            mental_models: clean_items(raw.mental_models),
            priorities: Priorities {
                must_have: clean_items(raw.priorities.must_have),
                nice_to_have: clean_items(raw.priorities.nice_to_have),
            },
            constraints: clean_items(raw.constraints),
            success_criteria: clean_text(&raw.success_criteria),
            hypothesis: raw
                .hypothesis
                .map(|h| clean_text(&h))
                .filter(|h| !h.is_empty()),
            extracted_at: Utc::now(),
        })
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(TITLE);
        out.push_str("\n\n");
        push_section(&mut out, WHY, &self.strategic_why);
        push_section(&mut out, DECISION, &self.decision_context);
        push_section(&mut out, SUCCESS, &self.success_criteria);
        push_list(&mut out, MODELS, &self.mental_models);
        out.push_str(PRIORITIES);
        out.push_str("\n\n");
        push_list(&mut out, MUST, &self.priorities.must_have);
        push_list(&mut out, NICE, &self.priorities.nice_to_have);
        push_list(&mut out, CONSTRAINTS, &self.constraints);
        if let Some(ref hypothesis) = self.hypothesis {
            push_section(&mut out, HYPOTHESIS, hypothesis);
        }
        out.push_str("---\n");
        out.push_str(EXTRACTED);
        out.push_str(
            &self
                .extracted_at
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
        out.push_str("_\n");
        out
    }

    pub fn from_markdown(markdown: &str) -> Result<Self> {
        let mut sections: Vec<(&str, Vec<&str>)> = Vec::new();
        let mut extracted_at = None;

        for line in markdown.lines() {
            if line == TITLE || line == "---" {
                continue;
            }
            if let Some(ts) = line.strip_prefix(EXTRACTED).and_then(|l| l.strip_suffix('_')) {
                let parsed = DateTime::parse_from_rfc3339(ts).map_err(|e| {
                    GtmError::MalformedExtraction(format!("bad extraction time: {}", e))
                })?;
                extracted_at = Some(parsed.with_timezone(&Utc));
                continue;
            }
            if [
                WHY,
                DECISION,
                SUCCESS,
                MODELS,
                PRIORITIES,
                MUST,
                NICE,
                CONSTRAINTS,
                HYPOTHESIS,
            ]
            .contains(&line)
            {
                sections.push((line, Vec::new()));
            } else if let Some((_, body)) = sections.last_mut() {
                body.push(line.strip_prefix('\\').unwrap_or(line));
            }
        }

        let section = |heading: &str| -> Option<String> {
            sections
                .iter()
                .find(|(h, _)| *h == heading)
                .map(|(_, body)| body.join("\n").trim().to_string())
        };
        let list = |heading: &str| -> Vec<String> {
            sections
                .iter()
                .find(|(h, _)| *h == heading)
                .map(|(_, body)| {
                    body.iter()
                        .filter_map(|l| l.strip_prefix("- "))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let required = |heading: &str| {
            section(heading).ok_or_else(|| {
                GtmError::MalformedExtraction(format!("user context is missing {}", heading))
            })
        };

        Ok(Self {
            strategic_why: required(WHY)?,
            decision_context: required(DECISION)?,
            success_criteria: required(SUCCESS)?,
            mental_models: list(MODELS),
            priorities: Priorities {
                must_have: list(MUST),
                nice_to_have: list(NICE),
            },
            constraints: list(CONSTRAINTS),
            hypothesis: section(HYPOTHESIS).filter(|h| !h.is_empty()),
            extracted_at: extracted_at.ok_or_else(|| {
                GtmError::MalformedExtraction("user context has no extraction time".to_string())
            })?,
        })
    }

    /// First `max_chars` characters of the strategic rationale
    pub fn summary(&self, max_chars: usize) -> String {
        excerpt(&self.strategic_why, max_chars)
    }
}

/// Truncate on a character boundary, marking the cut with `...`
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

fn clean_text(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// List items are single lines in the markdown form
fn clean_items(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Body lines that would read back as structure get a leading backslash
fn escape_line(line: &str) -> String {
    if line.starts_with('#')
        || line.starts_with('\\')
        || line.starts_with(EXTRACTED)
        || line == "---"
    {
        format!("\\{}", line)
    } else {
        line.to_string()
    }
}

fn push_section(out: &mut String, heading: &str, body: &str) {
    out.push_str(heading);
    out.push_str("\n\n");
    for line in body.lines() {
        out.push_str(&escape_line(line));
        out.push('\n');
    }
    out.push('\n');
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    out.push_str(heading);
    out.push_str("\n\n");
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
    if !items.is_empty() {
        out.push('\n');
    }
}
