//! Persistence layer for Converse.
//!
//! Agents and conversations are persisted through two repository traits,
//! [`AgentRepository`] and [`ConversationRepository`], so the conversation
//! pipeline never touches the filesystem directly and can be exercised
//! against [`MemoryStore`] in tests.
//!
//! # Design decisions
//!
//! - **JSON snapshots on disk**: every write replaces the whole document for
//!   one agent or one conversation. There are no transactions; a crash can
//!   lose at most the write in flight.
//! - **Write-then-rename**: documents are written to a sibling temp file and
//!   renamed into place so readers never observe a truncated file.
//! - **Synchronous API**: repository calls do blocking I/O. Async callers run
//!   them through `tokio::task::spawn_blocking`.

mod error;
mod json;
mod memory;

pub use error::StoreError;
pub use json::JsonFileStore;
pub use memory::MemoryStore;

use converse_types::{Agent, ConversationRecord};

/// Storage for agent records.
pub trait AgentRepository: Send + Sync {
    /// Returns every stored agent. Unreadable entries are skipped.
    fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    /// Returns the agent with `id`, if stored.
    fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError>;

    /// Inserts or replaces an agent.
    fn put_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    /// Deletes an agent. Returns `false` if it did not exist.
    fn delete_agent(&self, id: &str) -> Result<bool, StoreError>;
}

/// Storage for conversation snapshots (metadata plus turns).
pub trait ConversationRepository: Send + Sync {
    /// Returns every stored conversation. Unreadable entries are skipped.
    fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError>;

    /// Returns the conversation with `id`, if stored.
    fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError>;

    /// Inserts or replaces a conversation snapshot.
    fn put_conversation(&self, record: &ConversationRecord) -> Result<(), StoreError>;

    /// Deletes a conversation. Returns `false` if it did not exist.
    fn delete_conversation(&self, id: &str) -> Result<bool, StoreError>;
}

/// Rejects identifiers that could escape their storage directory.
pub(crate) fn validate_id(id: &str) -> Result<(), StoreError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control);
    if bad {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}
