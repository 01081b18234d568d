// Command execution coordinator
//
// Turns queued commands into supervised agent CLI runs: enforces
// at-most-one-active-run-per-agent, consults the enablement flag,
// optionally delegates to a domain-specific interceptor, and otherwise
// drives the retrying runner with its output streamed into the store.
// Queue draining is event-driven: finishing one run dispatches the
// oldest still-pending command for that agent, and nothing else does.

pub mod collaborators;
pub mod registry;
pub mod stream_buffer;

pub use collaborators::{
    AgentGate, AlwaysEnabled, CommandInterceptor, InterceptedCommand, MemoryService, NoMemory,
};
pub use registry::RunRegistry;
pub use stream_buffer::StreamBuffer;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;

use crate::agents::{ProcessRunner, RetryingRunner, RunEvent};
use crate::config::BridgeConfig;
use crate::models::{Command, CommandStatus, SessionStatus};
use crate::storage::CommandStore;

pub struct CommandExecutor {
    store: Arc<dyn CommandStore>,
    config: Arc<BridgeConfig>,
    runner: RetryingRunner,
    registry: Arc<RunRegistry>,
    gate: Arc<dyn AgentGate>,
    interceptor: Option<Arc<dyn CommandInterceptor>>,
    memory: Arc<dyn MemoryService>,
}

impl CommandExecutor {
    pub fn new(store: Arc<dyn CommandStore>, config: Arc<BridgeConfig>) -> Self {
        let runner = RetryingRunner::new(ProcessRunner::new(Arc::clone(&config)));
        Self {
            store,
            config,
            runner,
            registry: Arc::new(RunRegistry::new()),
            gate: Arc::new(AlwaysEnabled),
            interceptor: None,
            memory: Arc::new(NoMemory),
        }
    }

    /// Replace the default runner, e.g. one with a shortened kill grace.
    pub fn with_runner(mut self, runner: RetryingRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn AgentGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = memory;
        self
    }

    /// Share a registry between executors. Tests use this to inspect
    /// slot state; production keeps the private default.
    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Execute one command, or leave it pending if its agent is busy.
    ///
    /// Returns once the run is underway; output streaming and
    /// finalization happen in background tasks. The follow-up dispatch
    /// of the agent's next pending command is triggered by the run's
    /// completion, never by this call.
    ///
    /// Boxed: a completed run re-enters this function through
    /// `pick_next_command`, so the future must be type-erased.
    pub fn execute_command(
        self: &Arc<Self>,
        command: Command,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>> {
        let executor = Arc::clone(self);
        Box::pin(async move { executor.execute_command_inner(command).await })
    }

    async fn execute_command_inner(self: &Arc<Self>, command: Command) -> Result<()> {
        let agent_id = command.agent_id.clone();

        if !self.registry.try_acquire(&agent_id) {
            log::info!(
                "[Executor] Agent '{}' has an active run, leaving command {} pending",
                agent_id,
                command.id
            );
            return Ok(());
        }

        // Enablement gate; lookup failure counts as enabled
        let enabled = match self.gate.is_enabled(&agent_id).await {
            Ok(enabled) => enabled,
            Err(e) => {
                log::warn!(
                    "[Executor] Enablement lookup failed for '{}', assuming enabled: {}",
                    agent_id,
                    e
                );
                true
            }
        };
        if !enabled {
            log::info!(
                "[Executor] Agent '{}' is disabled, cancelling command {}",
                agent_id,
                command.id
            );
            let result = self.cancel_disabled(&command).await;
            self.registry.release(&agent_id);
            return result;
        }

        // Domain-specific interception
        if let Some(interceptor) = &self.interceptor {
            if let Some(intercepted) = interceptor.parse(&command.message) {
                log::info!(
                    "[Executor] Command {} intercepted as '{}' instruction",
                    command.id,
                    intercepted.action
                );
                let executor = Arc::clone(self);
                let interceptor = Arc::clone(interceptor);
                tokio::spawn(async move {
                    executor
                        .run_intercepted(command, intercepted, interceptor)
                        .await;
                });
                return Ok(());
            }
        }

        // General path: best-effort memory enrichment first
        let message = match self.memory.enrich(&agent_id, &command.message).await {
            Ok(Some(context)) => format!("{}\n\n{}", context, command.message),
            Ok(None) => command.message.clone(),
            Err(e) => {
                log::warn!(
                    "[Executor] Memory enrichment failed for '{}', continuing without: {}",
                    agent_id,
                    e
                );
                command.message.clone()
            }
        };

        self.mark_running(&command).await;

        let buffer = StreamBuffer::new(Arc::clone(&self.store), &command.id);
        buffer.start();

        let mut events = match self
            .runner
            .run(&agent_id, &message, self.config.default_timeout_secs)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                // Spawn rejected before any process existed; no exit
                // event will ever fire, so the slot release alone is
                // enough and no next command is dispatched here.
                log::error!(
                    "[Executor] Run rejected for command {}: {}",
                    command.id,
                    e
                );
                buffer.write(&format!("Unable to start run: {}\n", e)).await;
                buffer.end(1).await;
                if let Err(e) = self
                    .store
                    .set_command_status(&command.id, CommandStatus::Failed)
                    .await
                {
                    log::error!("[Executor] Failed to mark command {} failed: {}", command.id, e);
                }
                self.set_session(&agent_id, SessionStatus::Idle).await;
                self.registry.release(&agent_id);
                return Ok(());
            }
        };

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut raw_output = String::new();
            while let Some(event) = events.recv().await {
                match event {
                    RunEvent::Chunk(text) => {
                        raw_output.push_str(&text);
                        buffer.write(&text).await;
                    }
                    RunEvent::Exit(code) => {
                        executor
                            .finish_run(&command, &raw_output, code, &buffer)
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Dispatch the oldest still-pending command for an agent, if any.
    /// Sole mechanism for per-agent queue draining.
    pub async fn pick_next_command(self: &Arc<Self>, agent_id: &str) {
        match self.store.oldest_pending(agent_id).await {
            Ok(Some(next)) => {
                log::info!(
                    "[Executor] Dispatching queued command {} for agent '{}'",
                    next.id,
                    agent_id
                );
                let executor = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = executor.execute_command(next).await {
                        log::error!("[Executor] Queued dispatch failed: {}", e);
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!(
                    "[Executor] Failed to query pending commands for '{}': {}",
                    agent_id,
                    e
                );
            }
        }
    }

    /// Finalize a run after its terminal exit event.
    async fn finish_run(
        self: &Arc<Self>,
        command: &Command,
        raw_output: &str,
        exit_code: i32,
        buffer: &StreamBuffer,
    ) {
        let agent_id = &command.agent_id;
        self.registry.release(agent_id);

        buffer.end(exit_code).await;

        let status = if exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        if let Err(e) = self.store.set_command_status(&command.id, status).await {
            log::error!(
                "[Executor] Failed to set command {} status to {:?}: {}",
                command.id,
                status,
                e
            );
        }

        // Detached outcome capture; never awaited by the critical path
        let memory = Arc::clone(&self.memory);
        let capture_agent = agent_id.clone();
        let capture_message = command.message.clone();
        let capture_output = raw_output.to_string();
        tokio::spawn(async move {
            if let Err(e) = memory
                .capture(&capture_agent, &capture_message, &capture_output, exit_code)
                .await
            {
                log::warn!(
                    "[Executor] Outcome capture failed for agent '{}': {}",
                    capture_agent,
                    e
                );
            }
        });

        self.set_session(agent_id, SessionStatus::Idle).await;

        log::info!(
            "[Executor] Command {} finished with exit {} ({:?})",
            command.id,
            exit_code,
            status
        );
        self.pick_next_command(agent_id).await;
    }

    /// Run an intercepted instruction through its delegate, with the
    /// same lifecycle bookkeeping as a general run. The slot release and
    /// next-command dispatch happen regardless of the delegate outcome.
    async fn run_intercepted(
        self: &Arc<Self>,
        command: Command,
        intercepted: InterceptedCommand,
        interceptor: Arc<dyn CommandInterceptor>,
    ) {
        let agent_id = command.agent_id.clone();

        self.mark_running(&command).await;

        let buffer = StreamBuffer::new(Arc::clone(&self.store), &command.id);
        buffer.start();
        buffer
            .write(&format!("Executing {} instruction...\n", intercepted.action))
            .await;

        let (status, exit_code) = match interceptor.execute(&agent_id, &intercepted).await {
            Ok(result) => {
                buffer.write(&result).await;
                (CommandStatus::Completed, 0)
            }
            Err(e) => {
                log::warn!(
                    "[Executor] Intercepted '{}' instruction failed for command {}: {}",
                    intercepted.action,
                    command.id,
                    e
                );
                buffer
                    .write(&format!("Instruction failed: {}\n", e))
                    .await;
                (CommandStatus::Failed, 1)
            }
        };

        buffer.end(exit_code).await;
        if let Err(e) = self.store.set_command_status(&command.id, status).await {
            log::error!(
                "[Executor] Failed to set command {} status to {:?}: {}",
                command.id,
                status,
                e
            );
        }
        self.set_session(&agent_id, SessionStatus::Idle).await;

        self.registry.release(&agent_id);
        self.pick_next_command(&agent_id).await;
    }

    /// Cancel a command whose agent is disabled, with one explanatory
    /// terminal response. Nothing is spawned.
    async fn cancel_disabled(&self, command: &Command) -> Result<()> {
        self.store
            .set_command_status(&command.id, CommandStatus::Cancelled)
            .await?;
        let note = format!(
            "Agent '{}' is currently disabled; command was cancelled.",
            command.agent_id
        );
        if let Err(e) = self.store.append_chunk(&command.id, &note, true).await {
            log::warn!(
                "[Executor] Failed to write cancellation notice for command {}: {}",
                command.id,
                e
            );
        }
        Ok(())
    }

    async fn mark_running(&self, command: &Command) {
        if let Err(e) = self
            .store
            .set_command_status(&command.id, CommandStatus::Running)
            .await
        {
            log::error!(
                "[Executor] Failed to mark command {} running: {}",
                command.id,
                e
            );
        }
        self.set_session(&command.agent_id, SessionStatus::Busy).await;
    }

    async fn set_session(&self, agent_id: &str, status: SessionStatus) {
        if let Err(e) = self.store.upsert_session(agent_id, status).await {
            log::warn!(
                "[Executor] Failed to set session for '{}' to {}: {}",
                agent_id,
                status,
                e
            );
        }
    }
}
