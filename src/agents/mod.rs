// Agent CLI process execution: supervised runs with bounded retry

pub mod retry;
pub mod runner;

pub use retry::{RetryingRunner, MAX_RUN_ATTEMPTS};
pub use runner::{
    ProcessRunner, RunEvent, RunHandle, RunnerError, KILL_GRACE_SECS, TIMEOUT_EXIT_CODE,
};
