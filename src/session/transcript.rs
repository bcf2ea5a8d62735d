//! Conversation transcript format
//!
//! ```text
//! # Conversation History
//!
//! ## USER
//!
//! <message>
//!
//! ## AGENT
//!
//! <message>
//!
//! ```
//!
//! Message lines that would read as a heading (or that start with the escape
//! character) are prefixed with `\`, so any message text survives a round
//! trip unchanged.

use super::message::{Message, Role};
use crate::{GtmError, Result};

const TITLE: &str = "# Conversation History\n\n";
const USER_HEADING: &str = "## USER\n\n";
const AGENT_HEADING: &str = "## AGENT\n\n";
const LEGACY_AGENT_HEADING: &str = "## ASSISTANT\n\n";
const SEPARATOR: &str = "\n\n";

pub fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::from(TITLE);
    for message in messages {
        out.push_str(match message.role {
            Role::User => USER_HEADING,
            Role::Agent => AGENT_HEADING,
        });
        out.push_str(&escape(&message.content));
        out.push_str(SEPARATOR);
    }
    out
}

pub fn parse_transcript(text: &str) -> Result<Vec<Message>> {
    let mut rest = text
        .strip_prefix(TITLE)
        .ok_or_else(|| malformed("missing title"))?;

    let mut messages = Vec::new();
    while !rest.is_empty() {
        let (role, body) = if let Some(body) = rest.strip_prefix(USER_HEADING) {
            (Role::User, body)
        } else if let Some(body) = rest
            .strip_prefix(AGENT_HEADING)
            .or_else(|| rest.strip_prefix(LEGACY_AGENT_HEADING))
        {
            (Role::Agent, body)
        } else {
            return Err(malformed("expected a message heading"));
        };

        // Escaped content never contains a line starting with "## "
        let end = body.find("\n## ").map(|i| i + 1).unwrap_or(body.len());
        let chunk = &body[..end];
        let content = chunk
            .strip_suffix(SEPARATOR)
            .ok_or_else(|| malformed("message is not terminated"))?;

        messages.push(Message {
            role,
            content: unescape(content),
        });
        rest = &body[end..];
    }
    Ok(messages)
}

fn malformed(reason: &str) -> GtmError {
    GtmError::Corrupt {
        path: "conversation-history.md".into(),
        reason: reason.to_string(),
    }
}

fn escape(content: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            if line.starts_with("## ") || line.starts_with("# ") || line.starts_with('\\') {
                format!("\\{}", line)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape(content: &str) -> String {
    content
        .split('\n')
        .map(|line| line.strip_prefix('\\').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(messages: Vec<Message>) {
        let text = format_transcript(&messages);
        assert_eq!(parse_transcript(&text).unwrap(), messages);
    }

    #[test]
    fn test_simple_round_trip() {
        round_trip(vec![
            Message::user("We sell payroll software to restaurants."),
            Message::agent("Who signs the contract?"),
            Message::user("Usually the owner."),
        ]);
    }

    #[test]
    fn test_awkward_content_round_trips() {
        round_trip(vec![
            Message::user("## USER\n\nnot a heading"),
            Message::agent("trailing newlines\n\n\n"),
            Message::user(""),
            Message::agent("\\already escaped\n# Title\n\n## AGENT"),
            Message::user("\n\nleading"),
        ]);
    }

    #[test]
    fn test_empty_history() {
        round_trip(Vec::new());
        assert_eq!(format_transcript(&[]), "# Conversation History\n\n");
    }

    #[test]
    fn test_layout() {
        let text = format_transcript(&[Message::user("hi"), Message::agent("hello")]);
        assert_eq!(
            text,
            "# Conversation History\n\n## USER\n\nhi\n\n## AGENT\n\nhello\n\n"
        );
    }

    #[test]
    fn test_legacy_assistant_heading() {
        let text = "# Conversation History\n\n## USER\n\nhi\n\n## ASSISTANT\n\nhello\n\n";
        let messages = parse_transcript(text).unwrap();
        assert_eq!(messages[1], Message::agent("hello"));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(parse_transcript("random notes").is_err());
        assert!(parse_transcript("# Conversation History\n\n## USER\n\nunterminated").is_err());
    }
}
