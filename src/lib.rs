//! GTM Factory - multi-agent research orchestration
//!
//! A conversational agent learns the user's strategic intent, plans research
//! "drops", fans each drop out to parallel researchers and folds their findings
//! into a living Latest Document. Everything a drop produces is persisted so an
//! interrupted session can pick up where it stopped.
//!
//! # Architecture
//!
//! - **storage**: Atomic file store and the on-disk project layout
//! - **drop**: Drop plans, the drop state machine and crash recovery
//! - **session**: Conversation history, user context and session state
//! - **budget**: Context window accounting
//! - **dispatch**: Concurrent researcher fan-out with retry and cancellation
//! - **synthesis**: Latest Document and critical analysis passes
//! - **metadata**: Compact drop and session summaries
//! - **hq**: Ties the pieces together for one session
//! - **integrations**: Anthropic agent, research API client, retry policy
//! - **config**: YAML configuration and validation

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod storage;

// Research pipeline
pub mod budget;
pub mod dispatch;
pub mod drop;
pub mod hq;
pub mod integrations;
pub mod metadata;
pub mod session;
pub mod synthesis;

// Re-exports
pub use error::{GtmError, Result};
