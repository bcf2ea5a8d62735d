//! Durable storage for sessions and drops
//!
//! - **store**: atomic file writes and typed reads
//! - **layout**: where each artifact lives

pub mod layout;
mod store;

pub use layout::{DropLayout, ProjectLayout, SessionLayout};
pub use store::DurableStore;
