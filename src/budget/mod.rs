//! Context budget tracking
//!
//! Estimates how much of the agent's context window the session is using,
//! at roughly four characters per token. The figures are advisory: they
//! drive warnings and compaction hints, never billing.

use crate::session::Message;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_MAX_TOKENS: usize = 200_000;
pub const DEFAULT_WARN_THRESHOLD: f64 = 80.0;
pub const DEFAULT_KEEP_RECENT: usize = 15;

/// Compaction only pays off once this many messages exceed `keep_recent`
const COMPACTION_MARGIN: usize = 5;
/// Share of summarized tokens a compaction is expected to save
const COMPACTION_RATIO: f64 = 0.7;

pub const CONVERSATION: &str = "conversation";
pub const LATEST_DOCUMENT: &str = "latest_md";
pub const CRITICAL_ANALYSIS: &str = "critical_analysis_md";
pub const USER_CONTEXT: &str = "user_context_md";
pub const OTHER: &str = "other";

const KNOWN_SOURCES: [&str; 4] = [CONVERSATION, LATEST_DOCUMENT, CRITICAL_ANALYSIS, USER_CONTEXT];

/// Approximate token count: one per four characters, at least one for non-empty text
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.chars().count() / 4).max(1)
    }
}

fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Per-source token estimates against a ceiling
#[derive(Debug, Clone)]
pub struct ContextBudgetTracker {
    max_tokens: usize,
    warn_threshold: f64,
    usage: BTreeMap<String, usize>,
}

/// Snapshot for display and logging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub total: usize,
    pub max_tokens: usize,
    pub percentage: f64,
    pub remaining: usize,
    pub breakdown: BTreeMap<String, usize>,
}

impl Default for ContextBudgetTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}

impl ContextBudgetTracker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            usage: BTreeMap::new(),
        }
    }

    pub fn with_warn_threshold(mut self, threshold: f64) -> Self {
        self.warn_threshold = threshold;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Set the estimate for `label`, replacing any previous one
    pub fn add(&mut self, label: &str, content: &str) {
        self.usage.insert(label.to_string(), estimate_tokens(content));
    }

    pub fn add_conversation(&mut self, messages: &[Message]) {
        self.usage
            .insert(CONVERSATION.to_string(), estimate_messages(messages));
    }

    pub fn remove(&mut self, label: &str) {
        self.usage.remove(label);
    }

    pub fn reset(&mut self) {
        self.usage.clear();
    }

    pub fn total(&self) -> usize {
        self.usage.values().sum()
    }

    pub fn percentage(&self) -> f64 {
        if self.max_tokens == 0 {
            return 100.0;
        }
        self.total() as f64 / self.max_tokens as f64 * 100.0
    }

    pub fn remaining(&self) -> usize {
        self.max_tokens.saturating_sub(self.total())
    }

    /// True once usage reaches `threshold` percent
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.percentage() >= threshold
    }

    /// True once usage reaches the configured warning threshold
    pub fn should_warn(&self) -> bool {
        self.exceeds(self.warn_threshold)
    }

    /// Usage per known source; unrecognized labels are summed under `other`
    pub fn breakdown(&self) -> BTreeMap<String, usize> {
        let mut out: BTreeMap<String, usize> = KNOWN_SOURCES
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        out.insert(OTHER.to_string(), 0);
        for (label, tokens) in &self.usage {
            let key = if KNOWN_SOURCES.contains(&label.as_str()) {
                label.as_str()
            } else {
                OTHER
            };
            *out.entry(key.to_string()).or_insert(0) += tokens;
        }
        out
    }

    pub fn report(&self) -> BudgetReport {
        BudgetReport {
            total: self.total(),
            max_tokens: self.max_tokens,
            percentage: self.percentage(),
            remaining: self.remaining(),
            breakdown: self.breakdown(),
        }
    }

    /// `45K / 200K (22.5%)`
    pub fn format_display(&self) -> String {
        format!(
            "{}K / {}K ({:.1}%)",
            self.total() / 1000,
            self.max_tokens / 1000,
            self.percentage()
        )
    }

    /// Text progress bar, e.g. `[#####---------------]`
    pub fn format_bar(&self, width: usize) -> String {
        let filled = ((self.percentage().min(100.0) / 100.0) * width as f64).round() as usize;
        format!(
            "[{}{}]",
            "#".repeat(filled),
            "-".repeat(width.saturating_sub(filled))
        )
    }
}

/// Whether summarizing older messages would be worth it
pub fn can_compact(messages: &[Message], keep_recent: usize) -> bool {
    messages.len() > keep_recent + COMPACTION_MARGIN
}

/// Tokens a compaction keeping the last `keep_recent` messages would save
///
/// Zero when [`can_compact`] is false.
pub fn estimate_compaction_savings(messages: &[Message], keep_recent: usize) -> usize {
    if !can_compact(messages, keep_recent) {
        return 0;
    }
    let old = &messages[..messages.len() - keep_recent];
    (estimate_messages(old) as f64 * COMPACTION_RATIO) as usize
}

/// Advisory line for the budget display; `None` while compaction would not pay off
pub fn compaction_hint(messages: &[Message], keep_recent: usize) -> Option<String> {
    let savings = estimate_compaction_savings(messages, keep_recent);
    (savings > 0).then(|| {
        format!(
            "Summarizing all but the last {} messages would free about {} tokens",
            keep_recent, savings
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn test_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&chars(4000)), 1000);
    }

    #[test]
    fn test_add_overwrites_label() {
        let mut tracker = ContextBudgetTracker::new(10_000);
        tracker.add(LATEST_DOCUMENT, &chars(4000));
        tracker.add(LATEST_DOCUMENT, &chars(400));
        assert_eq!(tracker.total(), 100);
    }

    #[test]
    fn test_breakdown_groups_unknown_labels() {
        let mut tracker = ContextBudgetTracker::default();
        tracker.add_conversation(&[Message::user(chars(400)), Message::agent(chars(800))]);
        tracker.add("scratch", &chars(40));
        tracker.add("notes", &chars(80));

        let breakdown = tracker.breakdown();
        assert_eq!(breakdown[CONVERSATION], 300);
        assert_eq!(breakdown[OTHER], 30);
        assert_eq!(breakdown[USER_CONTEXT], 0);
        assert_eq!(tracker.total(), 330);
    }

    #[test]
    fn test_warning_threshold() {
        let mut tracker = ContextBudgetTracker::new(1000);
        tracker.add(CONVERSATION, &chars(3196));
        assert!(!tracker.should_warn());
        tracker.add(CONVERSATION, &chars(3200));
        assert!(tracker.should_warn());
        assert_eq!(tracker.remaining(), 200);
        assert!(tracker.exceeds(50.0));
    }

    #[test]
    fn test_display() {
        let mut tracker = ContextBudgetTracker::default();
        tracker.add(CONVERSATION, &chars(180_000));
        assert_eq!(tracker.format_display(), "45K / 200K (22.5%)");
        assert_eq!(tracker.format_bar(8), "[##------]");
    }

    #[test]
    fn test_compaction() {
        let messages: Vec<Message> = (0..20).map(|_| Message::user(chars(400))).collect();
        assert!(!can_compact(&messages, 15));
        assert_eq!(estimate_compaction_savings(&messages, 15), 0);

        let messages: Vec<Message> = (0..25).map(|_| Message::user(chars(400))).collect();
        assert!(can_compact(&messages, 15));
        // 10 summarized messages of 100 tokens, 70% saved
        assert_eq!(estimate_compaction_savings(&messages, 15), 700);
    }

    #[test]
    fn test_compaction_hint() {
        let short: Vec<Message> = (0..20).map(|_| Message::user(chars(400))).collect();
        assert_eq!(compaction_hint(&short, 15), None);

        let long: Vec<Message> = (0..25).map(|_| Message::user(chars(400))).collect();
        assert_eq!(
            compaction_hint(&long, 15).as_deref(),
            Some("Summarizing all but the last 15 messages would free about 700 tokens")
        );
    }
}
