//! Agent integration for the flowforge orchestration engine.
//!
//! Agent execution is split into two small contracts composed by a thin
//! combinator:
//!
//! - [`TypeAdapter`]: the semantic layer. Builds an [`ExecutorRequest`]
//!   (image, command, env) from a workflow-level [`AgentRequest`] and
//!   parses the [`ExecutorResponse`] back into a normalized output.
//! - [`Executor`]: the runtime layer. Actually runs the sandboxed
//!   process, streams structured events back, and harvests the git
//!   side-channel metadata.
//!
//! Each agent variant is one file; the container-runtime strategy is one
//! file. The [`AdapterRegistry`] resolves a logical role to a concrete
//! adapter + model.

pub mod adapter;
pub mod claude;
pub mod codex;
pub mod docker;
pub mod error;
pub mod mock;
pub mod prompt;
pub mod registry;
pub mod types;

pub use adapter::{
    Adapter, CombinedAdapter, EventCallback, ExecuteOptions, Executor, ExecutorRequest,
    ExecutorResponse, TypeAdapter,
};
pub use claude::ClaudeCodeAdapter;
pub use codex::CodexAdapter;
pub use docker::DockerExecutor;
pub use error::AgentError;
pub use mock::MockAdapter;
pub use prompt::PromptBuilder;
pub use registry::AdapterRegistry;
pub use types::{
    AgentRequest, AgentResponse, ChangeStatus, ChangedFile, ExecutionMetrics, GitMetadata,
    OpsxConfig,
};
