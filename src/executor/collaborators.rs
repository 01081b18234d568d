// Collaborator seams consumed by the executor
//
// The enablement flag, domain-specific command interception (e.g. the
// swap executor) and memory enrichment/capture live outside this crate.
// Enrichment and capture are strictly best-effort: their failures are
// logged at the call site and never abort a run.

use anyhow::Result;
use async_trait::async_trait;

/// Per-agent enable/disable flag lookup.
#[async_trait]
pub trait AgentGate: Send + Sync {
    async fn is_enabled(&self, agent_id: &str) -> Result<bool>;
}

/// Gate that never disables anything. Default for tests and simple
/// deployments.
pub struct AlwaysEnabled;

#[async_trait]
impl AgentGate for AlwaysEnabled {
    async fn is_enabled(&self, _agent_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// A recognized domain-specific instruction extracted from a message.
#[derive(Debug, Clone)]
pub struct InterceptedCommand {
    /// Instruction kind, e.g. "swap"
    pub action: String,
    /// Parsed instruction parameters
    pub params: serde_json::Value,
}

/// Message-based command interception.
///
/// `parse` decides whether a message is a recognized instruction;
/// parsing failures are treated as no-match by callers. `execute` runs
/// the instruction and returns its result text for streaming.
#[async_trait]
pub trait CommandInterceptor: Send + Sync {
    fn parse(&self, message: &str) -> Option<InterceptedCommand>;
    async fn execute(&self, agent_id: &str, command: &InterceptedCommand) -> Result<String>;
}

/// Contextual memory enrichment and outcome capture.
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Optional context text to prefix onto the message before a run.
    async fn enrich(&self, agent_id: &str, message: &str) -> Result<Option<String>>;

    /// Record a finished run for future enrichment.
    async fn capture(
        &self,
        agent_id: &str,
        message: &str,
        raw_output: &str,
        exit_code: i32,
    ) -> Result<()>;
}

/// Memory service that remembers nothing.
pub struct NoMemory;

#[async_trait]
impl MemoryService for NoMemory {
    async fn enrich(&self, _agent_id: &str, _message: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn capture(
        &self,
        _agent_id: &str,
        _message: &str,
        _raw_output: &str,
        _exit_code: i32,
    ) -> Result<()> {
        Ok(())
    }
}
