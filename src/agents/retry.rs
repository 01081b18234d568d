// Single-retry wrapper around the process runner
//
// A failed first attempt (timeout sentinel 124 or any non-zero exit)
// gets exactly one more spawn with the same agent, message and timeout.
// The second attempt's outcome is final either way, bounding total
// process spawns per logical command to 2.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agents::runner::{ProcessRunner, RunEvent, RunnerError, TIMEOUT_EXIT_CODE};

/// Maximum process spawns per logical command.
pub const MAX_RUN_ATTEMPTS: u32 = 2;

pub struct RetryingRunner {
    runner: Arc<ProcessRunner>,
}

impl RetryingRunner {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Run a command with at most one automatic retry.
    ///
    /// Returns the merged event stream: chunks from every attempt, a
    /// retry notice between attempts, and exactly one terminal `Exit`.
    /// Allow-list validation errors surface synchronously before any
    /// process is spawned.
    pub async fn run(
        &self,
        agent_id: &str,
        message: &str,
        timeout_secs: u64,
    ) -> Result<mpsc::Receiver<RunEvent>, RunnerError> {
        let first = self.runner.spawn_run(agent_id, message, timeout_secs).await?;

        let (tx, rx) = mpsc::channel(64);
        let runner = Arc::clone(&self.runner);
        let agent = agent_id.to_string();
        let message = message.to_string();

        tokio::spawn(async move {
            let mut handle = first;
            let mut attempt: u32 = 1;

            loop {
                let mut exit_code = -1;
                while let Some(event) = handle.events.recv().await {
                    match event {
                        RunEvent::Chunk(text) => {
                            if tx.send(RunEvent::Chunk(text)).await.is_err() {
                                return;
                            }
                        }
                        RunEvent::Exit(code) => {
                            exit_code = code;
                            break;
                        }
                    }
                }

                // 124 (timeout) is already non-zero, listed for clarity
                let failed = exit_code == TIMEOUT_EXIT_CODE || exit_code != 0;
                if failed && attempt < MAX_RUN_ATTEMPTS {
                    attempt += 1;
                    log::warn!(
                        "[RetryingRunner] Agent '{}' attempt {} failed with exit {}, retrying",
                        agent,
                        attempt - 1,
                        exit_code
                    );
                    if tx
                        .send(RunEvent::Chunk(format!(
                            "\nAttempt failed (exit code {}), retrying...\n",
                            exit_code
                        )))
                        .await
                        .is_err()
                    {
                        return;
                    }

                    match runner.spawn_run(&agent, &message, timeout_secs).await {
                        Ok(next) => {
                            handle = next;
                            continue;
                        }
                        Err(e) => {
                            // Same agent id was already validated; only
                            // reachable if the allow-list changed mid-run
                            log::error!("[RetryingRunner] Retry spawn rejected: {}", e);
                            let _ = tx.send(RunEvent::Exit(exit_code)).await;
                            return;
                        }
                    }
                }

                let _ = tx.send(RunEvent::Exit(exit_code)).await;
                return;
            }
        });

        Ok(rx)
    }
}
