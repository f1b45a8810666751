//! Workflow DSL definition types.
//!
//! These structs mirror the YAML workflow document. A workflow consists of
//! a list of nodes (agent tasks and human gates) and optional edges; when
//! no edges are declared the node list is treated as a linear chain in
//! document order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The parsed YAML workflow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDsl {
    /// Human-readable workflow name.
    #[serde(default)]
    pub name: String,
    /// Version string of the workflow document.
    #[serde(default)]
    pub version: String,
    /// Description of what this workflow does.
    #[serde(default)]
    pub description: String,
    /// Declared parameter defaults.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Nodes in document order.
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    /// Explicit edges. Empty means linear chain in document order.
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

/// The kind of a workflow node.
///
/// The set is closed: dispatch in the engine is a match over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Executed by an external agent program inside a sandboxed container.
    AgentTask,
    /// A human must approve/reject/edit an intermediate artifact.
    HumanReview,
    /// A human must submit structured input.
    HumanInput,
}

impl NodeKind {
    /// Returns the wire representation of this node kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentTask => "agent_task",
            Self::HumanReview => "human_review",
            Self::HumanInput => "human_input",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown node kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNodeKind {
    /// The unrecognized wire value.
    pub value: String,
}

impl std::fmt::Display for UnknownNodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown node type: {}", self.value)
    }
}

impl std::error::Error for UnknownNodeKind {}

impl std::str::FromStr for NodeKind {
    type Err = UnknownNodeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_task" => Ok(Self::AgentTask),
            "human_review" => Ok(Self::HumanReview),
            "human_input" => Ok(Self::HumanInput),
            other => Err(UnknownNodeKind {
                value: other.to_string(),
            }),
        }
    }
}

/// A node definition in the DSL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique (within a flow) DAG-local identifier.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Node kind.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Which agent executes this node (agent_task only).
    #[serde(default)]
    pub agent: Option<AgentDef>,
    /// Node-specific configuration.
    #[serde(default)]
    pub config: Option<NodeConfigDef>,
    /// Behavior when a human reviewer rejects this node.
    #[serde(default)]
    pub on_reject: Option<OnRejectDef>,
    /// Node-level timeout, free-form duration string.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Automatic retry policy (enforced outside the core engine).
    #[serde(default)]
    pub retry: Option<RetryDef>,
}

/// Selects the agent persona for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDef {
    /// Logical role, resolved to an adapter + model at dispatch time.
    /// May itself be a template expression.
    #[serde(default)]
    pub role: String,
    /// Role to fall back to when the primary role cannot be resolved.
    #[serde(default)]
    pub fallback_role: Option<String>,
    /// Model override for this node.
    #[serde(default)]
    pub model: Option<String>,
}

/// Node-specific configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigDef {
    /// Agent mode, e.g. `spec`, `execute`, `review`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Prompt template rendered against the runtime context.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Template expression naming the artifact under review.
    #[serde(default)]
    pub review_target: Option<String>,
    /// Review actions offered to the human.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Form schema for human_input nodes.
    #[serde(default)]
    pub form: Vec<FormFieldDef>,
    /// Execution timeout, free-form duration string.
    #[serde(default)]
    pub timeout: Option<String>,
    /// OpenSpec sub-configuration.
    #[serde(default)]
    pub opsx: Option<OpsxConfigDef>,
    /// Artifact creation for this node's output.
    #[serde(default)]
    pub artifact: Option<ArtifactConfigDef>,
    /// Whether the UI should surface artifacts for this node.
    #[serde(default)]
    pub show_artifacts: bool,
    /// Paths the node is expected to produce artifacts at.
    #[serde(default)]
    pub artifact_paths: Vec<String>,
}

/// Artifact creation configuration for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactConfigDef {
    /// Artifact type, e.g. `prd`, `spec`, `plan`, `review_report`.
    #[serde(default)]
    pub r#type: String,
    /// Template expression for the artifact title.
    #[serde(default)]
    pub title: String,
    /// Template expression for the parent artifact id.
    #[serde(default)]
    pub derived_from: Option<String>,
}

/// OpenSpec sub-configuration carried through to the agent container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpsxConfigDef {
    /// Change name for the OpenSpec workflow.
    #[serde(default)]
    pub change_name: String,
    /// Schema variant.
    #[serde(default)]
    pub schema: Option<String>,
    /// Initialize the OpenSpec directory when missing.
    #[serde(default)]
    pub init_if_missing: bool,
    /// Post action, e.g. `archive` or `sync`.
    #[serde(default)]
    pub action: Option<String>,
}

/// A form field shown to the human on a human_input node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormFieldDef {
    /// Field key in the submitted data map.
    #[serde(default)]
    pub field: String,
    /// Input type, e.g. `text`, `select`.
    #[serde(default)]
    pub r#type: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Whether the field must be filled.
    #[serde(default)]
    pub required: bool,
    /// Options for select-style fields.
    #[serde(default)]
    pub options: Vec<String>,
}

/// A bound that may be a literal count or a template expression.
///
/// Template expressions that survive parameter substitution un-rendered
/// fall back to the default at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopBound {
    /// Literal count.
    Count(u32),
    /// Unresolved template expression.
    Template(String),
}

impl LoopBound {
    /// Resolves the bound to a count, using `default` for templates that
    /// never rendered to a number.
    #[must_use]
    pub fn count_or(&self, default: u32) -> u32 {
        match self {
            Self::Count(n) => *n,
            Self::Template(s) => s.trim().parse().unwrap_or(default),
        }
    }
}

/// Rejection behavior for a human_review node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnRejectDef {
    /// Explicit rollback target node id. Empty means the first
    /// predecessor of the rejected node.
    #[serde(default)]
    pub goto: Option<String>,
    /// Maximum attempts of the rollback target before the flow fails.
    #[serde(default)]
    pub max_loops: Option<LoopBound>,
    /// Extra fields injected into the rollback attempt's input.
    #[serde(default)]
    pub inject: HashMap<String, String>,
}

/// Default bound on reject/rollback cycles.
pub const DEFAULT_MAX_LOOPS: u32 = 3;

impl OnRejectDef {
    /// Returns the effective max_loops bound.
    #[must_use]
    pub fn max_loops(&self) -> u32 {
        self.max_loops
            .as_ref()
            .map_or(DEFAULT_MAX_LOOPS, |b| b.count_or(DEFAULT_MAX_LOOPS))
    }
}

/// Automatic retry policy for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryDef {
    /// Maximum automatic attempts.
    #[serde(default)]
    pub max_attempts: Option<LoopBound>,
    /// Backoff strategy, free-form string.
    #[serde(default)]
    pub backoff: Option<String>,
}

/// Default bound on automatic retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl RetryDef {
    /// Returns the effective max_attempts bound.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
            .as_ref()
            .map_or(DEFAULT_MAX_ATTEMPTS, |b| b.count_or(DEFAULT_MAX_ATTEMPTS))
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
    /// Upstream node id.
    pub from: String,
    /// Downstream node id.
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_wire_names() {
        assert_eq!(NodeKind::AgentTask.as_str(), "agent_task");
        assert_eq!(NodeKind::HumanReview.as_str(), "human_review");
        assert_eq!(NodeKind::HumanInput.as_str(), "human_input");
    }

    #[test]
    fn loop_bound_from_yaml_int() {
        let bound: LoopBound = serde_yaml::from_str("2").expect("parse");
        assert_eq!(bound, LoopBound::Count(2));
        assert_eq!(bound.count_or(3), 2);
    }

    #[test]
    fn loop_bound_from_yaml_template() {
        let bound: LoopBound = serde_yaml::from_str("\"{{ params.loops }}\"").expect("parse");
        assert_eq!(bound.count_or(3), 3);
    }

    #[test]
    fn loop_bound_from_substituted_number_string() {
        // After parameter substitution a templated bound may arrive as "5".
        let bound = LoopBound::Template("5".to_string());
        assert_eq!(bound.count_or(3), 5);
    }

    #[test]
    fn on_reject_defaults() {
        let def = OnRejectDef::default();
        assert_eq!(def.max_loops(), 3);
        assert!(def.goto.is_none());
    }

    #[test]
    fn minimal_node_parses() {
        let yaml = r#"
id: plan
name: Plan the change
type: agent_task
agent:
  role: requirement-analyst
config:
  mode: spec
  prompt_template: "Plan {{ task.title }}"
"#;
        let node: NodeDef = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(node.id, "plan");
        assert_eq!(node.kind, NodeKind::AgentTask);
        assert_eq!(node.agent.unwrap().role, "requirement-analyst");
        assert_eq!(node.config.unwrap().mode.as_deref(), Some("spec"));
    }

    #[test]
    fn review_node_with_on_reject() {
        let yaml = r#"
id: review
name: Review the plan
type: human_review
config:
  actions: [approve, reject, edit]
on_reject:
  goto: plan
  max_loops: 2
"#;
        let node: NodeDef = serde_yaml::from_str(yaml).expect("parse");
        let on_reject = node.on_reject.expect("on_reject");
        assert_eq!(on_reject.goto.as_deref(), Some("plan"));
        assert_eq!(on_reject.max_loops(), 2);
    }
}
