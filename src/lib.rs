// Clippy allows for reasonable defaults
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

// Module declarations
pub mod agents;
pub mod circuit_breaker;
pub mod config;
pub mod executor;
pub mod models;
pub mod storage;

// Re-export the pipeline surface for embedders
pub use agents::{ProcessRunner, RetryingRunner, RunEvent, RunHandle, RunnerError};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use config::BridgeConfig;
pub use executor::{
    AgentGate, CommandExecutor, CommandInterceptor, InterceptedCommand, MemoryService,
    RunRegistry, StreamBuffer,
};
pub use models::*;
pub use storage::{CommandStore, StoreError};
