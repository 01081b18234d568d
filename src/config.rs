// Bridge configuration: CLI executable selection, default timeout, agent allow-list

use std::path::PathBuf;

/// Name of the agent CLI binary resolved from PATH when no explicit
/// path is configured.
pub const DEFAULT_CLI_NAME: &str = "agentctl";

/// Default run timeout in seconds when `AGENT_CLI_TIMEOUT_SECS` is unset.
/// 0 disables the timeout entirely.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Agents the bridge will spawn runs for. Identifiers outside this list
/// are rejected before any process is started.
pub const DEFAULT_ALLOWED_AGENTS: &[&str] = &["main", "research", "trading", "support"];

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to the agent CLI executable
    pub cli_path: PathBuf,
    /// Run timeout in seconds (0 disables the timeout)
    pub default_timeout_secs: u64,
    /// Allow-listed agent identifiers
    pub allowed_agents: Vec<String>,
}

impl BridgeConfig {
    /// Build configuration from the environment.
    ///
    /// `AGENT_CLI_PATH` selects the executable, falling back to a PATH
    /// lookup of the default CLI name. `AGENT_CLI_TIMEOUT_SECS` overrides
    /// the default run timeout. `AGENT_CLI_AGENTS` (comma-separated)
    /// overrides the allow-list.
    pub fn from_env() -> anyhow::Result<Self> {
        let cli_path = match std::env::var("AGENT_CLI_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => which::which(DEFAULT_CLI_NAME).map_err(|_| {
                anyhow::anyhow!(
                    "Agent CLI not found. Set AGENT_CLI_PATH or install '{}' on PATH",
                    DEFAULT_CLI_NAME
                )
            })?,
        };

        let default_timeout_secs = std::env::var("AGENT_CLI_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let allowed_agents = match std::env::var("AGENT_CLI_AGENTS") {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => DEFAULT_ALLOWED_AGENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        log::info!(
            "[Config] Agent CLI: {:?}, default timeout: {}s",
            cli_path,
            default_timeout_secs
        );

        Ok(Self {
            cli_path,
            default_timeout_secs,
            allowed_agents,
        })
    }

    /// Configuration pointing at an explicit executable. Used by tests
    /// and embedders that manage the CLI path themselves.
    pub fn for_cli(cli_path: PathBuf) -> Self {
        Self {
            cli_path,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            allowed_agents: DEFAULT_ALLOWED_AGENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_allowed_agents(mut self, agents: &[&str]) -> Self {
        self.allowed_agents = agents.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn is_agent_allowed(&self, agent_id: &str) -> bool {
        self.allowed_agents.iter().any(|a| a == agent_id)
    }
}
