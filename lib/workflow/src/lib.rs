//! Workflow definition model for the flowforge orchestration engine.
//!
//! This crate provides:
//!
//! - **DSL types**: the YAML workflow document (nodes, edges, agent and
//!   review configuration)
//! - **DAG**: the derived dependency graph with entry/predecessor/successor
//!   lookups
//! - **Templates**: parameter pre-substitution and runtime template
//!   rendering for prompts

pub mod dag;
pub mod definition;
pub mod error;
pub mod template;

pub use dag::Dag;
pub use definition::{
    AgentDef, ArtifactConfigDef, EdgeDef, FormFieldDef, LoopBound, NodeConfigDef, NodeDef,
    NodeKind, OnRejectDef, OpsxConfigDef, RetryDef, UnknownNodeKind, WorkflowDsl,
};
pub use error::{DslError, TemplateError};
pub use template::{render, render_params};
