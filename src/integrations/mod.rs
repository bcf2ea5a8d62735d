//! External collaborators
//!
//! - **agent**: conversational agent trait
//! - **research**: research engine trait
//! - **anthropic**: Messages API implementation of the agent
//! - **research_api**: HTTP implementation of the research engine
//! - **retry**: exponential backoff shared by both

pub mod agent;
pub mod anthropic;
pub mod research;
pub mod research_api;
pub mod retry;

pub use agent::{ChunkSink, ConversationalAgent};
pub use anthropic::AnthropicAgent;
pub use research::{ResearchEngine, ResearchReport, Source};
pub use research_api::HttpResearchEngine;
pub use retry::{with_retry, with_retry_cancellable, RetryConfig, RetryDecision, RetryableError};
