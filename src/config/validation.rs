//! Configuration validation
//!
//! Checks values that deserialize fine but cannot work at runtime:
//! - budget ceiling and warning threshold in range
//! - endpoints are http(s) URLs
//! - API key environment variables are set (only when `check_env` is on)

use super::factory_config::FactoryConfig;
use crate::GtmError;

/// Validation error details
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every problem
pub fn validate_config(config: &FactoryConfig, check_env: bool) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.context.max_tokens == 0 {
        errors.push(ValidationError::new("context.max_tokens", "must be positive"));
    }
    if !(0.0..=100.0).contains(&config.context.warn_threshold) {
        errors.push(ValidationError::new(
            "context.warn_threshold",
            "must be a percentage between 0 and 100",
        ));
    }
    if config.dispatch.retry.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "dispatch.retry.multiplier",
            "must be at least 1.0",
        ));
    }

    for (field, url) in [
        ("agent.base_url", &config.agent.base_url),
        ("research.endpoint", &config.research.endpoint),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(ValidationError::new(field, format!("not an http(s) URL: {}", url)));
        }
    }

    if check_env {
        for (field, var) in [
            ("agent.api_key_env", &config.agent.api_key_env),
            ("research.api_key_env", &config.research.api_key_env),
        ] {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                errors.push(ValidationError::new(
                    field,
                    format!("environment variable {} is not set", var),
                ));
            }
        }
    }

    errors
}

/// Validate and convert problems into a single configuration error
pub fn validate_config_result(config: &FactoryConfig, check_env: bool) -> crate::Result<()> {
    let errors = validate_config(config, check_env);
    if errors.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
    Err(GtmError::Config(format!(
        "Invalid configuration:\n{}",
        lines.join("\n")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&FactoryConfig::default(), false).is_empty());
    }

    #[test]
    fn test_collects_all_problems() {
        let mut config = FactoryConfig::default();
        config.context.max_tokens = 0;
        config.context.warn_threshold = 120.0;
        config.research.endpoint = "localhost:8000".to_string();

        let errors = validate_config(&config, false);
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["context.max_tokens", "context.warn_threshold", "research.endpoint"]
        );
        assert!(validate_config_result(&config, false).is_err());
    }

    #[test]
    fn test_missing_env_var() {
        let mut config = FactoryConfig::default();
        config.agent.api_key_env = "GTM_FACTORY_TEST_UNSET_KEY".to_string();
        let errors = validate_config(&config, true);
        assert!(errors.iter().any(|e| e.field == "agent.api_key_env"));
    }
}
