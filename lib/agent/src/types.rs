//! Workflow-level agent request and response types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A request to an agent, built by the engine from the node definition
/// and the runtime context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Identifier the container is labelled with. The engine passes the
    /// node run id so container names trace back to attempts.
    pub task_id: String,
    /// Owning flow run.
    pub flow_run_id: String,
    /// DAG-local node id.
    pub node_id: String,
    /// Agent mode, e.g. `spec`, `execute`, `review`.
    pub mode: String,
    /// Rendered prompt from the node's prompt template.
    pub prompt: String,
    /// Input map of the attempt, plus `_role`.
    pub context: Map<String, JsonValue>,
    /// Working directory inside the sandbox.
    #[serde(default)]
    pub work_dir: String,
    /// Repository URL with the access token injected.
    #[serde(default)]
    pub git_repo_url: String,
    /// Branch the agent starts from.
    #[serde(default)]
    pub git_branch: String,
    /// Raw access token, for adapters that pass it separately.
    #[serde(default)]
    pub git_access_token: String,
    /// Title of the owning task.
    #[serde(default)]
    pub task_title: String,
    /// Display name of the node.
    #[serde(default)]
    pub node_name: String,
    /// System prompt for the resolved role.
    #[serde(default)]
    pub role_prompt: String,
    /// Human feedback carried in on a rejection rollback.
    #[serde(default)]
    pub feedback: String,
    /// Model override for this invocation.
    #[serde(default)]
    pub model: String,
    /// OpenSpec sub-configuration.
    #[serde(default)]
    pub opsx: Option<OpsxConfig>,
}

/// OpenSpec configuration carried through to the agent container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpsxConfig {
    /// Change name for the OpenSpec workflow.
    pub change_name: String,
    /// Schema variant.
    #[serde(default)]
    pub schema: String,
    /// Initialize the OpenSpec directory when missing.
    #[serde(default)]
    pub init_if_missing: bool,
    /// Post action, e.g. `archive` or `sync`.
    #[serde(default)]
    pub action: String,
}

/// The normalized result of an agent invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Normalized output map, persisted as the node run's output.
    pub output: Map<String, JsonValue>,
    /// Execution metrics, when the agent reported them.
    #[serde(default)]
    pub metrics: Option<ExecutionMetrics>,
    /// Git side-channel metadata, when the container produced it.
    #[serde(default)]
    pub git_metadata: Option<GitMetadata>,
}

/// Metrics reported by an agent run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Input tokens consumed.
    #[serde(default)]
    pub token_input: i64,
    /// Output tokens produced.
    #[serde(default)]
    pub token_output: i64,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: i64,
}

/// Git side-channel metadata extracted from
/// `/output/git_metadata.json` inside the agent container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitMetadata {
    /// Branch the agent pushed to.
    pub branch: String,
    /// Branch the work was forked from.
    pub base_branch: String,
    /// Head commit hash.
    pub commit: String,
    /// Head commit message.
    pub commit_message: String,
    /// Pull request URL, if one was opened.
    pub pr_url: String,
    /// Pull request number, if one was opened.
    pub pr_number: Option<i32>,
    /// Paths of files the agent changed.
    pub changed_files: Vec<String>,
    /// Per-file change detail.
    pub changed_files_detail: Vec<ChangedFile>,
    /// Repository the push went to.
    pub repo_url: String,
}

/// One changed file in the git side-channel metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Repository-relative path.
    pub path: String,
    /// What happened to the file.
    pub status: ChangeStatus,
}

/// Change status of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}
