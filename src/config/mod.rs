//! Configuration system
//!
//! Loads ~/.config/gtm-factory/config.yaml with settings for:
//! - where projects live on disk
//! - the context budget
//! - research dispatch retries
//! - the conversational agent and research engine endpoints

mod factory_config;
pub mod validation;

pub use factory_config::{
    AgentSettings, ContextSettings, DispatchSettings, FactoryConfig, ResearchSettings,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
