//! Durable state for the flowforge orchestration engine.
//!
//! The database is the single source of truth for "what has happened,
//! what is running, what is next". This crate provides:
//!
//! - **Records and status enums** for flow runs, node runs, timeline
//!   events, tasks, artifacts, and agent roles
//! - **The [`Store`] contract**: every transactional primitive the engine
//!   programs against
//! - **[`PgStore`]**: the Postgres implementation, whose atomic dequeue
//!   (`FOR UPDATE SKIP LOCKED`) carries the multi-worker correctness
//!   weight

pub mod error;
pub mod git_url;
pub mod models;
pub mod pg;
pub mod store;

pub use error::StoreError;
pub use git_url::inject_token_into_url;
pub use models::{
    AgentRoleConfig, FlowRunRecord, FlowStatus, NodeRunRecord, NodeStatus, ReviewAction,
    TaskGitInfo, TimelineEventRecord,
};
pub use pg::PgStore;
pub use store::Store;
