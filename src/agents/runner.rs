// Agent CLI process spawning and supervision
//
// One OS process per invocation. Output is published to a bounded event
// channel as decoded text chunks, terminated by a single Exit event that
// is always the last message. Timeout handling escalates SIGTERM ->
// grace window -> SIGKILL and reports the sentinel exit code 124.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::BridgeConfig;

/// Exit code reported when a run was terminated by the timeout
/// escalation path, regardless of what the OS reports for the killed
/// process.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Grace window between SIGTERM and SIGKILL.
pub const KILL_GRACE_SECS: u64 = 5;

/// Capacity of the run event channel.
const RUN_EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Agent '{0}' is not in the allow-list, refusing to spawn")]
    DisallowedAgent(String),
}

/// Events published by a supervised run.
///
/// `Exit` is the distinguished terminal message: exactly one is sent per
/// run and nothing follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Chunk(String),
    Exit(i32),
}

/// Handle to one supervised run.
///
/// Consumers read output and completion from `events`; `kill` forcibly
/// terminates the process out-of-band (there is no cooperative
/// cancellation once a process has been spawned).
pub struct RunHandle {
    /// OS pid, None when the spawn itself failed
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<RunEvent>,
}

impl RunHandle {
    /// Forcibly terminate the process. Best effort; the supervisor still
    /// reports the resulting exit through the event channel.
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            log::warn!("[Runner] Out-of-band kill requested for pid {}", pid);
            send_signal(pid, ForceKill::Yes);
        }
    }
}

enum ForceKill {
    No,
    Yes,
}

#[cfg(unix)]
fn send_signal(pid: u32, force: ForceKill) {
    let sig = match force {
        ForceKill::No => libc::SIGTERM,
        ForceKill::Yes => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: ForceKill) {}

/// Spawns and supervises one agent CLI process per invocation.
pub struct ProcessRunner {
    config: Arc<BridgeConfig>,
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            config,
            kill_grace: Duration::from_secs(KILL_GRACE_SECS),
        }
    }

    /// Shorten the SIGTERM -> SIGKILL grace window. Timing-sensitive
    /// tests use this; production keeps the default.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Build the CLI invocation for one run.
    ///
    /// The argument shape is fixed: subcommand, agent identifier,
    /// non-interactive mode flag, a freshly generated session token (so
    /// concurrent runs never collide on the CLI's local lock state), and
    /// the message payload.
    fn build_run_command(&self, agent_id: &str, message: &str, session_token: &str) -> Command {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.arg("run")
            .arg("--agent")
            .arg(agent_id)
            .arg("--non-interactive")
            .arg("--session")
            .arg(session_token)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Spawn one run for `agent_id` with `message`.
    ///
    /// `timeout_secs == 0` disables the timeout. Disallowed agents fail
    /// fast with no process spawned. A spawn failure (missing
    /// executable, permissions) is reported through the channel as a
    /// diagnostic chunk followed by `Exit(1)`; no handle is considered
    /// started in that case (`pid` is None).
    pub async fn spawn_run(
        &self,
        agent_id: &str,
        message: &str,
        timeout_secs: u64,
    ) -> Result<RunHandle, RunnerError> {
        if !self.config.is_agent_allowed(agent_id) {
            log::error!("[Runner] Rejected disallowed agent '{}'", agent_id);
            return Err(RunnerError::DisallowedAgent(agent_id.to_string()));
        }

        let session_token = Uuid::new_v4().to_string();
        let mut command = self.build_run_command(agent_id, message, &session_token);

        let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!(
                    "[Runner] Failed to spawn {:?} for agent '{}': {}",
                    self.config.cli_path,
                    agent_id,
                    e
                );
                let _ = tx
                    .send(RunEvent::Chunk(format!(
                        "Failed to start agent process: {}\n",
                        e
                    )))
                    .await;
                let _ = tx.send(RunEvent::Exit(1)).await;
                return Ok(RunHandle { pid: None, events: rx });
            }
        };

        let pid = child.id();
        log::info!(
            "[Runner] Spawned agent '{}' run (pid {:?}, session {})",
            agent_id,
            pid,
            session_token
        );

        let stdout_task = child.stdout.take().map(|out| spawn_pipe_reader(out, tx.clone()));
        let stderr_task = child.stderr.take().map(|err| spawn_pipe_reader(err, tx.clone()));

        let agent = agent_id.to_string();
        let kill_grace = self.kill_grace;
        tokio::spawn(async move {
            let exit_code = if timeout_secs > 0 {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(e) => {
                            log::error!("[Runner] Failed to wait for agent '{}': {}", agent, e);
                            -1
                        }
                    },
                    _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                        log::warn!(
                            "[Runner] Agent '{}' run timed out after {}s, sending SIGTERM",
                            agent,
                            timeout_secs
                        );
                        let _ = tx
                            .send(RunEvent::Chunk(format!(
                                "\nRun timed out after {} seconds, terminating.\n",
                                timeout_secs
                            )))
                            .await;
                        if let Some(pid) = pid {
                            send_signal(pid, ForceKill::No);
                        }

                        tokio::select! {
                            _ = child.wait() => {}
                            _ = tokio::time::sleep(kill_grace) => {
                                log::warn!(
                                    "[Runner] Agent '{}' ignored SIGTERM, sending SIGKILL",
                                    agent
                                );
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                            }
                        }
                        TIMEOUT_EXIT_CODE
                    }
                }
            } else {
                match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        log::error!("[Runner] Failed to wait for agent '{}': {}", agent, e);
                        -1
                    }
                }
            };

            // Drain the pipe readers so Exit is the last event
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            log::info!("[Runner] Agent '{}' run exited with code {}", agent, exit_code);
            let _ = tx.send(RunEvent::Exit(exit_code)).await;
        });

        Ok(RunHandle { pid, events: rx })
    }
}

/// Read a child pipe to EOF, forwarding decoded text chunks.
fn spawn_pipe_reader<R>(mut pipe: R, tx: mpsc::Sender<RunEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(RunEvent::Chunk(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("[Runner] Pipe read error: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn runner_for(path: &str) -> ProcessRunner {
        ProcessRunner::new(Arc::new(BridgeConfig::for_cli(PathBuf::from(path))))
    }

    #[tokio::test]
    async fn test_disallowed_agent_fails_fast() {
        let runner = runner_for("/bin/echo");
        let result = runner.spawn_run("rogue", "hi", 0).await;
        assert!(matches!(result, Err(RunnerError::DisallowedAgent(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_diagnostic_and_exit_1() {
        let runner = runner_for("/nonexistent/agentctl");
        let mut handle = runner.spawn_run("main", "hi", 0).await.unwrap();
        assert!(handle.pid.is_none());

        let first = handle.events.recv().await.unwrap();
        match first {
            RunEvent::Chunk(text) => assert!(text.contains("Failed to start agent process")),
            other => panic!("expected diagnostic chunk, got {:?}", other),
        }
        assert_eq!(handle.events.recv().await, Some(RunEvent::Exit(1)));
        assert_eq!(handle.events.recv().await, None);
    }

    #[test]
    fn test_build_run_command_arg_shape() {
        let runner = runner_for("/usr/local/bin/agentctl");
        let cmd = runner.build_run_command("main", "do the thing", "token-123");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "run",
                "--agent",
                "main",
                "--non-interactive",
                "--session",
                "token-123",
                "do the thing"
            ]
        );
    }

    #[tokio::test]
    async fn test_session_tokens_are_unique_per_run() {
        let runner = runner_for("/bin/true");
        // Two concurrent runs must never share a session token; the
        // token is a uuid generated per spawn.
        let a = runner.build_run_command("main", "x", &Uuid::new_v4().to_string());
        let b = runner.build_run_command("main", "x", &Uuid::new_v4().to_string());
        let token = |c: &Command| {
            c.as_std()
                .get_args()
                .map(|a| a.to_string_lossy().to_string())
                .nth(5)
                .unwrap()
        };
        assert_ne!(token(&a), token(&b));
    }
}
