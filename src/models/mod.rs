// Data models persisted by the external store and consumed by the dashboard

pub mod state_machine;

pub use state_machine::{can_transition, is_terminal_status, transition_status, StateTransitionError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a command.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; a command never
/// transitions back to `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of work submitted for one agent to execute.
///
/// Created by an external submitter (REST handler, voice glue); mutated
/// only by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub agent_id: String,
    pub message: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(agent_id: &str, message: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            message: message.to_string(),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// One fragment of a command's output, append-only in the store.
///
/// Concatenating all chunks for a command in insertion order reproduces
/// the raw text the process emitted. Exactly one chunk per command has
/// `is_final = true` and it is always the last one written; its content
/// carries no meaning, it is the completion sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub command_id: String,
    pub content: String,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// Availability status of an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Online,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Online => "online",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logical session per agent identifier, upserted on run start/end,
/// read by liveness monitors. Never deleted by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub agent_id: String,
    pub status: SessionStatus,
    pub last_heartbeat: DateTime<Utc>,
}
