//! GTM Factory configuration file handling
//!
//! Loads and saves ~/.config/gtm-factory/config.yaml.

use crate::budget::{
    ContextBudgetTracker, DEFAULT_KEEP_RECENT, DEFAULT_MAX_TOKENS, DEFAULT_WARN_THRESHOLD,
};
use crate::integrations::retry::RetryConfig;
use crate::session::ResearchMode;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Context window budget settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Warn when usage reaches this percentage
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,

    /// Messages kept verbatim when compaction is suggested
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_warn_threshold() -> f64 {
    DEFAULT_WARN_THRESHOLD
}

fn default_keep_recent() -> usize {
    DEFAULT_KEEP_RECENT
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            warn_threshold: default_warn_threshold(),
            keep_recent: default_keep_recent(),
        }
    }
}

impl ContextSettings {
    pub fn tracker(&self) -> ContextBudgetTracker {
        ContextBudgetTracker::new(self.max_tokens).with_warn_threshold(self.warn_threshold)
    }
}

/// Research dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "RetryConfig::for_research")]
    pub retry: RetryConfig,

    /// Inject drop outputs into the conversation once a drop completes
    #[serde(default = "default_true")]
    pub inject_results: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::for_research(),
            inject_results: true,
        }
    }
}

/// Conversational agent (Anthropic Messages API) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_agent_url")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_agent_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "RetryConfig::for_agent")]
    pub retry: RetryConfig,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_agent_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_agent_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_agent_url(),
            api_key_env: default_agent_key_env(),
            max_output_tokens: default_max_output_tokens(),
            retry: RetryConfig::for_agent(),
        }
    }
}

/// Research engine HTTP endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSettings {
    #[serde(default = "default_research_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_research_key_env")]
    pub api_key_env: String,

    /// Per-request timeout in seconds; deep research is slow
    #[serde(default = "default_research_timeout")]
    pub timeout_secs: u64,
}

fn default_research_endpoint() -> String {
    "http://localhost:8000/report".to_string()
}

fn default_research_key_env() -> String {
    "RESEARCH_API_KEY".to_string()
}

fn default_research_timeout() -> u64 {
    600
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            endpoint: default_research_endpoint(),
            api_key_env: default_research_key_env(),
            timeout_secs: default_research_timeout(),
        }
    }
}

/// GTM Factory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Root directory holding every project
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    #[serde(default)]
    pub default_mode: ResearchMode,

    #[serde(default)]
    pub context: ContextSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub research: ResearchSettings,
}

fn default_projects_root() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("gtm-factory");
    path.push("projects");
    path
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            projects_root: default_projects_root(),
            default_mode: ResearchMode::default(),
            context: ContextSettings::default(),
            dispatch: DispatchSettings::default(),
            agent: AgentSettings::default(),
            research: ResearchSettings::default(),
        }
    }
}

impl FactoryConfig {
    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::GtmError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            projects_root = %config.projects_root.display(),
            mode = %config.default_mode,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Load from `path` if given, else the default path, else built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::load_default() {
                Ok(config) => Ok(config),
                Err(crate::GtmError::Config(msg)) if msg.starts_with("Config file not found") => {
                    tracing::debug!("No config file, using defaults");
                    Ok(Self::default())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// ~/.config/gtm-factory/config.yaml
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("gtm-factory");
        path.push("config.yaml");
        path
    }
}
