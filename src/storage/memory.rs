// In-memory store used by tests and embedded deployments
//
// Behaves like the hosted database for the bridge's purposes: commands
// keyed by id, an append-only chunk log, sessions upserted by agent id.
// Write delay and failure injection exist so flush serialization and
// re-queue behavior can be exercised deterministically.

use crate::models::{AgentSession, Command, CommandStatus, ResponseChunk, SessionStatus};
use crate::storage::{CommandStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct InMemoryStore {
    commands: Mutex<HashMap<String, Command>>,
    chunks: Mutex<Vec<ResponseChunk>>,
    sessions: Mutex<HashMap<String, AgentSession>>,
    /// Artificial delay applied to every chunk append (test hook)
    append_delay_ms: AtomicUsize,
    /// Number of upcoming chunk appends that fail (test hook)
    failing_appends: AtomicUsize,
    /// Appends currently in flight, and the highest value observed
    appends_in_flight: AtomicUsize,
    max_appends_in_flight: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `append_chunk` by the given duration. Used to prove
    /// that flushes for one command never overlap.
    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Make the next `n` chunk appends fail with a write error.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// All chunks recorded for a command, in insertion order.
    pub fn chunks_for(&self, command_id: &str) -> Vec<ResponseChunk> {
        let chunks = self.chunks.lock().unwrap();
        chunks
            .iter()
            .filter(|c| c.command_id == command_id)
            .cloned()
            .collect()
    }

    /// Concatenation of all non-final chunk content for a command.
    pub fn reconstructed_output(&self, command_id: &str) -> String {
        self.chunks_for(command_id)
            .iter()
            .filter(|c| !c.is_final)
            .map(|c| c.content.as_str())
            .collect()
    }

    pub fn session(&self, agent_id: &str) -> Option<AgentSession> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(agent_id).cloned()
    }

    pub fn command_status(&self, command_id: &str) -> Option<CommandStatus> {
        let commands = self.commands.lock().unwrap();
        commands.get(command_id).map(|c| c.status)
    }

    /// Highest number of chunk appends ever observed in flight at once.
    /// Stays at 1 when flushes are properly serialized.
    pub fn max_concurrent_appends(&self) -> usize {
        self.max_appends_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandStore for InMemoryStore {
    async fn insert_command(&self, command: &Command) -> Result<(), StoreError> {
        let mut commands = self.commands.lock().unwrap();
        commands.insert(command.id.clone(), command.clone());
        Ok(())
    }

    async fn get_command(&self, command_id: &str) -> Result<Option<Command>, StoreError> {
        let commands = self.commands.lock().unwrap();
        Ok(commands.get(command_id).cloned())
    }

    async fn set_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
    ) -> Result<(), StoreError> {
        let mut commands = self.commands.lock().unwrap();
        match commands.get_mut(command_id) {
            Some(command) => {
                command.status = status;
                Ok(())
            }
            None => Err(StoreError::CommandNotFound(command_id.to_string())),
        }
    }

    async fn append_chunk(
        &self,
        command_id: &str,
        content: &str,
        is_final: bool,
    ) -> Result<(), StoreError> {
        let in_flight = self.appends_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_appends_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay_ms = self.append_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }

        // Consume one injected failure if armed
        let failing = self.failing_appends.load(Ordering::SeqCst);
        if failing > 0
            && self
                .failing_appends
                .compare_exchange(failing, failing - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.appends_in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::WriteFailed("injected append failure".to_string()));
        }

        {
            let mut chunks = self.chunks.lock().unwrap();
            chunks.push(ResponseChunk {
                command_id: command_id.to_string(),
                content: content.to_string(),
                is_final,
                created_at: Utc::now(),
            });
        }
        self.appends_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn oldest_pending(&self, agent_id: &str) -> Result<Option<Command>, StoreError> {
        let commands = self.commands.lock().unwrap();
        let oldest = commands
            .values()
            .filter(|c| c.agent_id == agent_id && c.status == CommandStatus::Pending)
            .min_by_key(|c| c.created_at)
            .cloned();
        Ok(oldest)
    }

    async fn upsert_session(
        &self,
        agent_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            agent_id.to_string(),
            AgentSession {
                agent_id: agent_id.to_string(),
                status,
                last_heartbeat: Utc::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_status_update() {
        let store = InMemoryStore::new();
        let cmd = Command::new("main", "hi");
        store.insert_command(&cmd).await.unwrap();

        store
            .set_command_status(&cmd.id, CommandStatus::Running)
            .await
            .unwrap();
        assert_eq!(store.command_status(&cmd.id), Some(CommandStatus::Running));
    }

    #[tokio::test]
    async fn test_status_update_unknown_command() {
        let store = InMemoryStore::new();
        let result = store
            .set_command_status("missing", CommandStatus::Running)
            .await;
        assert!(matches!(result, Err(StoreError::CommandNotFound(_))));
    }

    #[tokio::test]
    async fn test_chunks_preserve_insertion_order() {
        let store = InMemoryStore::new();
        store.append_chunk("c1", "hel", false).await.unwrap();
        store.append_chunk("c1", "lo", false).await.unwrap();
        store.append_chunk("c1", "", true).await.unwrap();

        assert_eq!(store.reconstructed_output("c1"), "hello");
        let chunks = store.chunks_for("c1");
        assert_eq!(chunks.len(), 3);
        assert!(chunks.last().unwrap().is_final);
    }

    #[tokio::test]
    async fn test_oldest_pending_is_fifo_by_creation() {
        let store = InMemoryStore::new();
        let mut first = Command::new("main", "first");
        let mut second = Command::new("main", "second");
        // Force distinct, ordered timestamps
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        second.created_at = Utc::now();
        store.insert_command(&second).await.unwrap();
        store.insert_command(&first).await.unwrap();

        let picked = store.oldest_pending("main").await.unwrap().unwrap();
        assert_eq!(picked.id, first.id);

        // Other agents' queues are invisible
        assert!(store.oldest_pending("research").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_append_failure() {
        let store = InMemoryStore::new();
        store.fail_next_appends(1);
        assert!(store.append_chunk("c1", "x", false).await.is_err());
        assert!(store.append_chunk("c1", "x", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_session() {
        let store = InMemoryStore::new();
        store
            .upsert_session("main", SessionStatus::Busy)
            .await
            .unwrap();
        assert_eq!(store.session("main").unwrap().status, SessionStatus::Busy);

        store
            .upsert_session("main", SessionStatus::Idle)
            .await
            .unwrap();
        assert_eq!(store.session("main").unwrap().status, SessionStatus::Idle);
    }
}
