//! Error types for agent execution.

use std::fmt;
use std::time::Duration;

/// Errors from agent adapters and executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// No adapter is registered for the requested role.
    NoAdapterForRole { role: String, known: String },
    /// The semantic layer could not build an executor request.
    BuildRequest { message: String },
    /// The container runtime failed (client error, image pull, create,
    /// start, log follow).
    Runtime { message: String },
    /// The agent process exited non-zero.
    ExecutionFailed { exit_code: i64, stderr: String },
    /// The container outlived its wall-clock budget and was killed.
    Timeout { limit: Duration },
    /// Execution was cancelled (flow cancel).
    Cancelled,
    /// The agent's output could not be parsed.
    ParseResponse { message: String },
}

impl AgentError {
    /// Returns true when the error is a cancellation, which the worker
    /// loop treats differently from a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAdapterForRole { role, known } => {
                write!(f, "no agent adapter found for role '{role}' (known: {known})")
            }
            Self::BuildRequest { message } => write!(f, "build agent request: {message}"),
            Self::Runtime { message } => write!(f, "container runtime: {message}"),
            Self::ExecutionFailed { exit_code, stderr } => {
                write!(f, "agent execution failed (exit code {exit_code}): {stderr}")
            }
            Self::Timeout { limit } => {
                write!(f, "container execution timed out after {limit:?}")
            }
            Self::Cancelled => write!(f, "agent execution cancelled"),
            Self::ParseResponse { message } => write!(f, "parse agent response: {message}"),
        }
    }
}

impl std::error::Error for AgentError {}
