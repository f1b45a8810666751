//! Domain records and status enums for durable state.

use chrono::{DateTime, Utc};
use flowforge_core::{FlowRunId, NodeRunId, TaskId, TimelineEventId, WorkflowId};
use flowforge_workflow::NodeKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Lifecycle state of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Created externally, not yet started.
    Pending,
    /// Actively executing.
    Running,
    /// Every node's latest attempt completed.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl FlowStatus {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the wire representation, defaulting unknown values to
    /// `Pending`.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a node run (one attempt of one DAG node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for predecessors to complete.
    Pending,
    /// Ready for a worker to claim.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Finished successfully; `output` is set.
    Completed,
    /// Finished with an error.
    Failed,
    /// Rejected by a human reviewer.
    Rejected,
    /// Parked until a human acts.
    WaitingHuman,
    /// Cancelled with its flow.
    Cancelled,
}

impl NodeStatus {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::WaitingHuman => "waiting_human",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the wire representation, defaulting unknown values to
    /// `Pending`.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "rejected" => Self::Rejected,
            "waiting_human" => Self::WaitingHuman,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Returns true if this is a terminal state for the attempt.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action a human took on a review node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    EditAndApprove,
}

impl ReviewAction {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::EditAndApprove => "edit_and_approve",
        }
    }
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunRecord {
    /// Flow run ID.
    pub id: FlowRunId,
    /// Task this flow run belongs to.
    pub task_id: TaskId,
    /// Workflow definition that was started.
    pub workflow_id: WorkflowId,
    /// Current status.
    pub status: FlowStatus,
    /// Error message when failed.
    pub error: Option<String>,
    /// The rendered-after-param-substitution workflow document.
    pub dsl_snapshot: Option<String>,
    /// Parameter map captured at start.
    pub variables: Option<JsonValue>,
    /// Branch the agents pushed to.
    pub branch_name: Option<String>,
    /// Pull request URL, if one was opened.
    pub pr_url: Option<String>,
    /// Pull request number, if one was opened.
    pub pr_number: Option<i32>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl FlowRunRecord {
    /// Creates a new pending flow run.
    #[must_use]
    pub fn new(task_id: TaskId, workflow_id: WorkflowId) -> Self {
        Self {
            id: FlowRunId::new(),
            task_id,
            workflow_id,
            status: FlowStatus::Pending,
            error: None,
            dsl_snapshot: None,
            variables: None,
            branch_name: None,
            pr_url: None,
            pr_number: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// One attempt of one DAG node within a flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunRecord {
    /// Node run ID.
    pub id: NodeRunId,
    /// Owning flow run.
    pub flow_run_id: FlowRunId,
    /// DAG-local node id.
    pub node_id: String,
    /// Node kind, fixed at creation.
    pub node_kind: NodeKind,
    /// Display name from the node definition.
    pub node_name: String,
    /// Current status.
    pub status: NodeStatus,
    /// 1-based attempt counter per (flow_run_id, node_id).
    pub attempt: i32,
    /// What was fed into this attempt.
    pub input: Option<JsonValue>,
    /// What the attempt produced. Set only when completed.
    pub output: Option<JsonValue>,
    /// Error message when failed.
    pub error: Option<String>,
    /// Worker that claimed this row.
    pub locked_by: Option<String>,
    /// When the claim was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Human review action, set only on human nodes.
    pub review_action: Option<String>,
    /// Human review comment.
    pub review_comment: Option<String>,
    /// When the review was recorded.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Structured events captured during a container run.
    pub log_stream: Option<JsonValue>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the row was created. Dequeue order.
    pub created_at: DateTime<Utc>,
}

impl NodeRunRecord {
    /// Creates a new attempt row.
    #[must_use]
    pub fn new(
        flow_run_id: FlowRunId,
        node_id: impl Into<String>,
        node_kind: NodeKind,
        node_name: impl Into<String>,
        status: NodeStatus,
        attempt: i32,
    ) -> Self {
        Self {
            id: NodeRunId::new(),
            flow_run_id,
            node_id: node_id.into(),
            node_kind,
            node_name: node_name.into(),
            status,
            attempt,
            input: None,
            output: None,
            error: None,
            locked_by: None,
            locked_at: None,
            review_action: None,
            review_comment: None,
            reviewed_at: None,
            log_stream: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the input on the new row.
    #[must_use]
    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input = Some(input);
        self
    }
}

/// Append-only audit record attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEventRecord {
    /// Event ID.
    pub id: TimelineEventId,
    /// Task this event belongs to.
    pub task_id: TaskId,
    /// Flow run the event narrows to, if any.
    pub flow_run_id: Option<FlowRunId>,
    /// Node run the event narrows to, if any.
    pub node_run_id: Option<NodeRunId>,
    /// Event type, e.g. `flow_started`, `review_rejected`.
    pub event_type: String,
    /// Free-form event payload.
    pub content: JsonValue,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl TimelineEventRecord {
    /// Creates a new timeline event.
    #[must_use]
    pub fn new(task_id: TaskId, event_type: impl Into<String>, content: JsonValue) -> Self {
        Self {
            id: TimelineEventId::new(),
            task_id,
            flow_run_id: None,
            node_run_id: None,
            event_type: event_type.into(),
            content,
            created_at: Utc::now(),
        }
    }

    /// Narrows the event to a flow run.
    #[must_use]
    pub fn for_flow_run(mut self, flow_run_id: FlowRunId) -> Self {
        self.flow_run_id = Some(flow_run_id);
        self
    }

    /// Narrows the event to a node run.
    #[must_use]
    pub fn for_node_run(mut self, node_run_id: NodeRunId) -> Self {
        self.node_run_id = Some(node_run_id);
        self
    }
}

/// Git metadata for a task, joined from its project.
///
/// `repo_url` already carries the access token when one is configured.
#[derive(Debug, Clone, Default)]
pub struct TaskGitInfo {
    /// Repository URL with the token injected (HTTPS) or as stored (SSH).
    pub repo_url: String,
    /// Base branch the agents fork from.
    pub base_branch: String,
    /// Raw access token, for adapters that pass it separately.
    pub access_token: String,
    /// Task title.
    pub title: String,
}

/// Per-role agent configuration stored in the database.
#[derive(Debug, Clone)]
pub struct AgentRoleConfig {
    /// Role slug.
    pub slug: String,
    /// Provider the role resolves to (e.g. `claude-code`, `codex`).
    pub agent_type: String,
    /// Model override, if any.
    pub default_model: Option<String>,
    /// System prompt override, if any.
    pub system_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_status_roundtrip() {
        for status in [
            FlowStatus::Pending,
            FlowStatus::Running,
            FlowStatus::Completed,
            FlowStatus::Failed,
            FlowStatus::Cancelled,
        ] {
            assert_eq!(FlowStatus::from_str_value(status.as_str()), status);
        }
    }

    #[test]
    fn node_status_roundtrip() {
        for status in [
            NodeStatus::Pending,
            NodeStatus::Queued,
            NodeStatus::Running,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Rejected,
            NodeStatus::WaitingHuman,
            NodeStatus::Cancelled,
        ] {
            assert_eq!(NodeStatus::from_str_value(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_defaults_to_pending() {
        assert_eq!(NodeStatus::from_str_value("bogus"), NodeStatus::Pending);
        assert_eq!(FlowStatus::from_str_value("bogus"), FlowStatus::Pending);
    }

    #[test]
    fn terminal_states() {
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Rejected.is_terminal());
        assert!(!NodeStatus::WaitingHuman.is_terminal());
        assert!(!NodeStatus::Queued.is_terminal());
        assert!(FlowStatus::Cancelled.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
    }

    #[test]
    fn node_run_record_builder() {
        let flow = FlowRunId::new();
        let record = NodeRunRecord::new(
            flow,
            "plan",
            NodeKind::AgentTask,
            "Plan",
            NodeStatus::Queued,
            1,
        )
        .with_input(serde_json::json!({"_feedback": "tighten scope"}));

        assert_eq!(record.flow_run_id, flow);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.status, NodeStatus::Queued);
        assert_eq!(record.input.unwrap()["_feedback"], "tighten scope");
    }

    #[test]
    fn review_action_wire_names() {
        assert_eq!(ReviewAction::Approve.as_str(), "approve");
        assert_eq!(ReviewAction::EditAndApprove.as_str(), "edit_and_approve");
    }
}
