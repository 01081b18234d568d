// Persistent store contract for commands, response chunks and sessions
//
// The dashboard's managed database is the single source of truth for
// command and session state. The bridge only sees it through this trait;
// concrete backends (the hosted database, the in-memory store below) are
// wired in by the embedding application.

pub mod memory;

pub use memory::InMemoryStore;

use crate::models::{Command, CommandStatus, SessionStatus};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Store write failed: {0}")]
    WriteFailed(String),

    #[error("Store read failed: {0}")]
    ReadFailed(String),
}

/// Store operations the bridge depends on.
///
/// `append_chunk` is append-only: chunk order in the store is insertion
/// order, and consumers reconstruct a command's output by concatenating
/// its chunks in that order. Duplicate delivery after a partial flush
/// failure is possible; consumers must tolerate it.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a newly submitted command (used by submitters and tests).
    async fn insert_command(&self, command: &Command) -> Result<(), StoreError>;

    /// Fetch a command by id.
    async fn get_command(&self, command_id: &str) -> Result<Option<Command>, StoreError>;

    /// Update a command's lifecycle status.
    async fn set_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
    ) -> Result<(), StoreError>;

    /// Append one response chunk for a command.
    async fn append_chunk(
        &self,
        command_id: &str,
        content: &str,
        is_final: bool,
    ) -> Result<(), StoreError>;

    /// Oldest still-pending command for an agent, FIFO by creation time.
    async fn oldest_pending(&self, agent_id: &str) -> Result<Option<Command>, StoreError>;

    /// Upsert the per-agent session status, refreshing the heartbeat.
    async fn upsert_session(
        &self,
        agent_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError>;
}
