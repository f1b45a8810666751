//! Error types for the engine.

use flowforge_agent::AgentError;
use flowforge_core::{FlowRunId, NodeRunId};
use flowforge_store::{FlowStatus, NodeStatus, StoreError};
use flowforge_workflow::DslError;
use std::fmt;

/// Errors from engine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Durable-state operation failed.
    Store(StoreError),
    /// The workflow document failed to parse.
    Dsl(DslError),
    /// Agent execution failed.
    Agent(AgentError),
    /// A handler was called on a node in the wrong state.
    InvalidNodeState {
        node_run_id: NodeRunId,
        expected: &'static str,
        actual: NodeStatus,
    },
    /// CancelFlow was called on a flow already terminal.
    FlowNotCancellable {
        flow_run_id: FlowRunId,
        status: FlowStatus,
    },
    /// The flow run carries no DSL snapshot.
    MissingSnapshot { flow_run_id: FlowRunId },
    /// A node referenced by a node run is absent from the DAG.
    NodeNotInDag { node_id: String },
    /// Submitted human input was not a JSON object.
    InvalidHumanInput { message: String },
}

impl EngineError {
    /// Returns true when the underlying cause is a flow cancellation,
    /// which the worker loop suppresses instead of failing the flow.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Agent(e) if e.is_cancelled())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Dsl(e) => write!(f, "workflow error: {e}"),
            Self::Agent(e) => write!(f, "agent error: {e}"),
            Self::InvalidNodeState {
                node_run_id,
                expected,
                actual,
            } => write!(
                f,
                "node run {node_run_id} is not {expected}, current status: {actual}"
            ),
            Self::FlowNotCancellable {
                flow_run_id,
                status,
            } => write!(f, "cannot cancel flow {flow_run_id} in status: {status}"),
            Self::MissingSnapshot { flow_run_id } => {
                write!(f, "flow run {flow_run_id} has no DSL snapshot")
            }
            Self::NodeNotInDag { node_id } => {
                write!(f, "node {node_id} not found in DAG")
            }
            Self::InvalidHumanInput { message } => {
                write!(f, "invalid input data: {message}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<DslError> for EngineError {
    fn from(e: DslError) -> Self {
        Self::Dsl(e)
    }
}

impl From<AgentError> for EngineError {
    fn from(e: AgentError) -> Self {
        Self::Agent(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = EngineError::InvalidNodeState {
            node_run_id: NodeRunId::new(),
            expected: "waiting_human",
            actual: NodeStatus::Completed,
        };
        let text = err.to_string();
        assert!(text.contains("waiting_human"));
        assert!(text.contains("completed"));
    }

    #[test]
    fn cancellation_detection() {
        assert!(EngineError::Agent(AgentError::Cancelled).is_cancellation());
        assert!(!EngineError::NodeNotInDag {
            node_id: "a".to_string()
        }
        .is_cancellation());
    }
}
