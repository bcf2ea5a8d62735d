//! Research modes
//!
//! The mode selects the directive the headquarters agent runs under and
//! the slant of every researcher's guidance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResearchMode {
    #[default]
    General,
    IcpValidation,
    GtmExecution,
    CompetitiveIntel,
}

impl ResearchMode {
    pub const ALL: [ResearchMode; 4] = [
        Self::General,
        Self::IcpValidation,
        Self::GtmExecution,
        Self::CompetitiveIntel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::IcpValidation => "icp-validation",
            Self::GtmExecution => "gtm-execution",
            Self::CompetitiveIntel => "competitive-intel",
        }
    }

    /// Mode-specific system directive for the headquarters agent
    pub fn directive(&self) -> &'static str {
        match self {
            Self::General => {
                "You are the research headquarters for a go-to-market team. \
                 Ask one focused question at a time until you understand why the \
                 user needs this research, what decision it informs, and what \
                 success looks like. Then propose a drop of 1-4 parallel research \
                 assignments."
            }
            Self::IcpValidation => {
                "You are the research headquarters running ICP validation. \
                 Probe who the ideal customer is, which signals qualify them, and \
                 which assumptions about them are untested. Propose research that \
                 tries to disprove the current ICP hypothesis."
            }
            Self::GtmExecution => {
                "You are the research headquarters planning GTM execution. \
                 Focus on channels, messaging, pricing, and sequencing. Propose \
                 research that turns the strategy into concrete, testable plays."
            }
            Self::CompetitiveIntel => {
                "You are the research headquarters gathering competitive \
                 intelligence. Establish which competitors matter and why, then \
                 propose research on their positioning, pricing, and weaknesses."
            }
        }
    }

    /// One-line slant appended to researcher guidance
    pub fn research_focus(&self) -> &'static str {
        match self {
            Self::General => "Balance breadth with evidence quality.",
            Self::IcpValidation => {
                "Prioritize evidence about buyer profiles, pains, and buying triggers."
            }
            Self::GtmExecution => {
                "Prioritize evidence about channels, messaging, and conversion."
            }
            Self::CompetitiveIntel => {
                "Prioritize evidence about competitor positioning, pricing, and gaps."
            }
        }
    }
}

impl fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown research mode: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_round_trip() {
        for mode in ResearchMode::ALL {
            assert_eq!(mode.as_str().parse::<ResearchMode>().unwrap(), mode);
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode.as_str()));
        }
        assert!("sales".parse::<ResearchMode>().is_err());
    }
}
