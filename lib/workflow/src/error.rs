//! Error types for the workflow crate.

use std::fmt;

/// Errors from parsing a workflow document into a DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DslError {
    /// The YAML document could not be deserialized.
    Yaml { message: String },
    /// The workflow declares no nodes.
    NoNodes,
    /// A node is missing its `id`.
    MissingNodeId { index: usize },
    /// Two nodes share the same `id`.
    DuplicateNodeId { node_id: String },
    /// An edge names a node that does not exist.
    UnknownEdgeEndpoint { node_id: String },
    /// The declared edges form a cycle.
    CycleDetected,
}

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yaml { message } => write!(f, "parse workflow document: {message}"),
            Self::NoNodes => write!(f, "workflow has no nodes"),
            Self::MissingNodeId { index } => {
                write!(f, "node at index {index} has no id")
            }
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id: {node_id}")
            }
            Self::UnknownEdgeEndpoint { node_id } => {
                write!(f, "edge references unknown node: {node_id}")
            }
            Self::CycleDetected => write!(f, "workflow graph contains a cycle"),
        }
    }
}

impl std::error::Error for DslError {}

/// Error from rendering a template expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    /// What went wrong, as reported by the template engine.
    pub message: String,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "render template: {}", self.message)
    }
}

impl std::error::Error for TemplateError {}
