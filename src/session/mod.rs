//! Conversation sessions
//!
//! A session is an ordered history of user and agent turns plus the
//! durable state (mode, drop counter) that outlives the process.

mod conversation;
mod extract;
mod message;
mod mode;
mod state;
pub mod transcript;
pub mod user_context;

pub use conversation::{generate_session_id, ConversationSession};
pub use extract::extract_json_object;
pub use message::{Message, Role};
pub use mode::ResearchMode;
pub use state::SessionState;
pub use user_context::{excerpt, Priorities, UserContext};
