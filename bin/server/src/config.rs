//! Centralized server configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! environment variables, with per-field defaults for everything but
//! the database URL.

use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the HTTP control API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Number of worker loops claiming queued node runs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Idle queue poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Agent configuration.
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Agent adapter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Default container image for the Claude Code adapter.
    #[serde(default)]
    pub claude_image: Option<String>,

    /// Default container image for the Codex adapter.
    #[serde(default)]
    pub codex_image: Option<String>,

    /// Default model for the Claude Code adapter.
    #[serde(default)]
    pub claude_model: Option<String>,

    /// Default model for the Codex adapter.
    #[serde(default)]
    pub codex_model: Option<String>,

    /// Container execution timeout in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            claude_image: None,
            codex_image: None,
            claude_model: None,
            codex_model: None,
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_agent_timeout_secs() -> u64 {
    600
}

impl ServerConfig {
    /// Loads configuration from the environment. Nested fields use a
    /// double-underscore separator, e.g. `AGENT__CLAUDE_MODEL`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?
            .try_deserialize()
    }
}
