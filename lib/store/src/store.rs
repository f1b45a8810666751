//! The store contract the engine programs against.
//!
//! [`PgStore`](crate::PgStore) is the production implementation; tests
//! drive the engine against an in-memory implementation of this trait.

use crate::error::StoreError;
use crate::models::{
    AgentRoleConfig, FlowRunRecord, FlowStatus, NodeRunRecord, NodeStatus, TaskGitInfo,
    TimelineEventRecord,
};
use async_trait::async_trait;
use flowforge_core::{ArtifactId, FlowRunId, NodeRunId, TaskId};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

/// Durable-state primitives for the orchestration engine.
///
/// Three operations carry correctness weight and have contracts beyond
/// plain CRUD:
///
/// - [`acquire_next_node_run`](Store::acquire_next_node_run): atomic
///   dequeue; no row is ever visible to two workers simultaneously.
/// - [`reset_stale_running_nodes`](Store::reset_stale_running_nodes):
///   boot-time recovery; assumes no peer engine is concurrently claiming
///   (one active engine per database).
/// - The latest-attempt views (`completed_node_ids`,
///   `pending_node_runs`, `all_nodes_completed`): evaluate over only the
///   highest attempt per node id, so completed rows from a prior pass
///   never count after a rejection rolled the node back.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ─── Flow runs ───

    /// Loads a flow run by id.
    async fn flow_run(&self, id: FlowRunId) -> Result<FlowRunRecord, StoreError>;

    /// Updates the status of a flow run, stamping `started_at` /
    /// `completed_at` as appropriate.
    async fn update_flow_run_status(
        &self,
        id: FlowRunId,
        status: FlowStatus,
    ) -> Result<(), StoreError>;

    /// Sets a terminal status and error message on a flow run.
    async fn update_flow_run_error(
        &self,
        id: FlowRunId,
        status: FlowStatus,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Persists the rendered DSL snapshot and captured parameters.
    async fn save_dsl_snapshot(
        &self,
        id: FlowRunId,
        dsl: &str,
        variables: &HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Updates PR-related fields. Each field is written only when the new
    /// value is non-empty, preserving earlier state.
    async fn update_flow_run_pr(
        &self,
        id: FlowRunId,
        branch_name: &str,
        pr_url: &str,
        pr_number: Option<i32>,
    ) -> Result<(), StoreError>;

    // ─── Node runs ───

    /// Inserts a new node run attempt.
    async fn create_node_run(&self, record: &NodeRunRecord) -> Result<(), StoreError>;

    /// Atomically claims the oldest queued node run for `worker_id`,
    /// transitioning it to `running` with lock fields set. Returns `None`
    /// when no queued work exists.
    async fn acquire_next_node_run(
        &self,
        worker_id: &str,
    ) -> Result<Option<NodeRunRecord>, StoreError>;

    /// Re-queues every `running` row left behind by a dead worker,
    /// clearing lock fields. Returns the count reset. Boot-time only;
    /// unsafe while a peer engine is claiming.
    async fn reset_stale_running_nodes(&self) -> Result<u64, StoreError>;

    /// Loads a node run by id.
    async fn node_run(&self, id: NodeRunId) -> Result<NodeRunRecord, StoreError>;

    /// Loads the highest-attempt row for `(flow_run_id, node_id)`.
    async fn latest_node_run(
        &self,
        flow_run_id: FlowRunId,
        node_id: &str,
    ) -> Result<Option<NodeRunRecord>, StoreError>;

    /// Updates the status of a node run, stamping `completed_at` on
    /// terminal transitions.
    async fn update_node_run_status(
        &self,
        id: NodeRunId,
        status: NodeStatus,
    ) -> Result<(), StoreError>;

    /// Sets the input of a node run.
    async fn update_node_run_input(
        &self,
        id: NodeRunId,
        input: &JsonValue,
    ) -> Result<(), StoreError>;

    /// Sets the output of a node run.
    async fn update_node_run_output(
        &self,
        id: NodeRunId,
        output: &JsonValue,
    ) -> Result<(), StoreError>;

    /// Sets a terminal status and error message on a node run.
    async fn update_node_run_error(
        &self,
        id: NodeRunId,
        status: NodeStatus,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Records a human review action on a node run.
    async fn update_node_run_review(
        &self,
        id: NodeRunId,
        action: &str,
        comment: &str,
    ) -> Result<(), StoreError>;

    /// Persists the buffered structured-event log of a container run.
    async fn update_node_run_log_stream(
        &self,
        id: NodeRunId,
        events: &[JsonValue],
    ) -> Result<(), StoreError>;

    /// Node ids whose latest attempt is `completed`.
    async fn completed_node_ids(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<HashSet<String>, StoreError>;

    /// Node runs whose status is `pending` and which are the latest
    /// attempt for their node id.
    async fn pending_node_runs(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<Vec<NodeRunRecord>, StoreError>;

    /// True when the latest attempt of every node in the flow is
    /// `completed`.
    async fn all_nodes_completed(&self, flow_run_id: FlowRunId) -> Result<bool, StoreError>;

    /// Latest completed attempt's output per node id, across the whole
    /// flow run.
    async fn all_node_run_outputs(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<HashMap<String, JsonValue>, StoreError>;

    /// Cancels every `pending` / `queued` node run of a flow.
    async fn cancel_pending_node_runs(&self, flow_run_id: FlowRunId) -> Result<(), StoreError>;

    // ─── Tasks ───

    /// Git metadata for a task, joined from its project, with the access
    /// token already injected into the HTTPS repository URL.
    async fn task_git_info(&self, task_id: TaskId) -> Result<TaskGitInfo, StoreError>;

    /// Updates the task's working branch.
    async fn update_task_git_branch(
        &self,
        task_id: TaskId,
        branch: &str,
    ) -> Result<(), StoreError>;

    // ─── Timeline ───

    /// Appends an immutable timeline event.
    async fn create_timeline_event(&self, record: &TimelineEventRecord) -> Result<(), StoreError>;

    // ─── Artifacts ───

    /// Creates an artifact record and returns its id.
    async fn create_artifact(
        &self,
        task_id: TaskId,
        artifact_type: &str,
        title: &str,
        file_path: &str,
    ) -> Result<ArtifactId, StoreError>;

    /// Creates a version row for an artifact.
    async fn create_artifact_version(
        &self,
        artifact_id: ArtifactId,
        version: i32,
        content: &str,
        change_summary: &str,
        created_by: &str,
    ) -> Result<(), StoreError>;

    // ─── Agent roles ───

    /// Per-role configuration, if the role exists in the database.
    async fn agent_role_config(&self, slug: &str)
        -> Result<Option<AgentRoleConfig>, StoreError>;
}
