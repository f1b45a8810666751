//! Core domain types for the flowforge orchestration engine.
//!
//! This crate provides the strongly-typed identifiers shared by every
//! other crate in the workspace.

pub mod id;

pub use id::{
    ArtifactId, FlowRunId, NodeRunId, ParseIdError, ProjectId, TaskId, TimelineEventId, WorkflowId,
};
