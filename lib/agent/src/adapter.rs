//! Adapter and executor contracts.

use crate::error::AgentError;
use crate::types::{AgentRequest, AgentResponse, GitMetadata};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Callback invoked for each structured event an agent emits while it
/// runs. The engine flattens these into the node run's log stream.
pub type EventCallback = Arc<dyn Fn(JsonValue) + Send + Sync>;

/// Per-invocation options threaded through to the runtime layer.
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Fired by the engine when the owning flow is cancelled. The
    /// executor must treat it as an immediate kill signal.
    pub cancel: CancellationToken,
    /// Receives structured events during the run.
    pub on_event: Option<EventCallback>,
}

impl ExecuteOptions {
    /// Options with a fresh token and no event callback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            on_event: None,
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the event callback.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Emits an event to the callback, if one is registered.
    pub fn emit(&self, event: JsonValue) {
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An agent adapter: the engine-facing contract.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable adapter name, used as the provider key in the registry.
    fn name(&self) -> &str;

    /// Executes the agent. May suspend for minutes.
    async fn execute(
        &self,
        req: &AgentRequest,
        opts: &ExecuteOptions,
    ) -> Result<AgentResponse, AgentError>;
}

impl std::fmt::Debug for dyn Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter").field("name", &self.name()).finish()
    }
}

/// The semantic layer: builds executor requests, parses responses.
#[async_trait]
pub trait TypeAdapter: Send + Sync {
    /// Stable adapter name.
    fn name(&self) -> &str;

    /// Builds the runtime-layer request (prompt composition, env
    /// derivation).
    async fn build_request(&self, req: &AgentRequest) -> Result<ExecutorRequest, AgentError>;

    /// Parses the runtime-layer response into a normalized output.
    fn parse_response(&self, resp: &ExecutorResponse) -> Result<AgentResponse, AgentError>;
}

/// The runtime layer: actually runs the agent.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runtime strategy name, e.g. `docker`.
    fn kind(&self) -> &str;

    /// Runs the request to completion, driving `opts.on_event` with any
    /// structured events emitted during execution.
    async fn execute(
        &self,
        req: &ExecutorRequest,
        opts: &ExecuteOptions,
    ) -> Result<ExecutorResponse, AgentError>;
}

/// The runtime-layer request.
#[derive(Debug, Clone, Default)]
pub struct ExecutorRequest {
    /// Container image name.
    pub image: String,
    /// Command to run inside the container. Empty means the image's
    /// entrypoint.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Working directory inside the container.
    pub work_dir: String,
    /// Wall-clock budget. Zero means the executor default.
    pub timeout: Duration,
}

/// The runtime-layer response.
#[derive(Debug, Clone, Default)]
pub struct ExecutorResponse {
    /// Process exit code.
    pub exit_code: i64,
    /// Complete captured stdout.
    pub stdout: String,
    /// Complete captured stderr.
    pub stderr: String,
    /// Side-channel metadata harvested from the container filesystem.
    pub git_metadata: Option<GitMetadata>,
}

/// Bridges a [`TypeAdapter`] and an [`Executor`] into an [`Adapter`].
pub struct CombinedAdapter {
    type_adapter: Arc<dyn TypeAdapter>,
    executor: Arc<dyn Executor>,
}

impl CombinedAdapter {
    /// Composes the two layers.
    #[must_use]
    pub fn new(type_adapter: Arc<dyn TypeAdapter>, executor: Arc<dyn Executor>) -> Self {
        Self {
            type_adapter,
            executor,
        }
    }
}

#[async_trait]
impl Adapter for CombinedAdapter {
    fn name(&self) -> &str {
        self.type_adapter.name()
    }

    async fn execute(
        &self,
        req: &AgentRequest,
        opts: &ExecuteOptions,
    ) -> Result<AgentResponse, AgentError> {
        let exec_req = self.type_adapter.build_request(req).await?;
        let exec_resp = self.executor.execute(&exec_req, opts).await?;
        self.type_adapter.parse_response(&exec_resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct EchoTypeAdapter;

    #[async_trait]
    impl TypeAdapter for EchoTypeAdapter {
        fn name(&self) -> &str {
            "echo"
        }

        async fn build_request(&self, req: &AgentRequest) -> Result<ExecutorRequest, AgentError> {
            let mut env = HashMap::new();
            env.insert("AGENT_PROMPT".to_string(), req.prompt.clone());
            Ok(ExecutorRequest {
                image: "echo:latest".to_string(),
                env,
                ..Default::default()
            })
        }

        fn parse_response(&self, resp: &ExecutorResponse) -> Result<AgentResponse, AgentError> {
            let mut output = serde_json::Map::new();
            output.insert("result".to_string(), json!(resp.stdout.clone()));
            Ok(AgentResponse {
                output,
                metrics: None,
                git_metadata: resp.git_metadata.clone(),
            })
        }
    }

    struct StaticExecutor {
        stdout: String,
    }

    #[async_trait]
    impl Executor for StaticExecutor {
        fn kind(&self) -> &str {
            "static"
        }

        async fn execute(
            &self,
            req: &ExecutorRequest,
            opts: &ExecuteOptions,
        ) -> Result<ExecutorResponse, AgentError> {
            opts.emit(json!({"type": "assistant", "content": req.env["AGENT_PROMPT"]}));
            Ok(ExecutorResponse {
                exit_code: 0,
                stdout: self.stdout.clone(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn combined_adapter_chains_layers() {
        let adapter = CombinedAdapter::new(
            Arc::new(EchoTypeAdapter),
            Arc::new(StaticExecutor {
                stdout: "done".to_string(),
            }),
        );

        let events: Arc<Mutex<Vec<JsonValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let opts = ExecuteOptions::new()
            .with_event_callback(Arc::new(move |e| sink.lock().unwrap().push(e)));

        let req = AgentRequest {
            prompt: "do the thing".to_string(),
            ..Default::default()
        };
        let resp = adapter.execute(&req, &opts).await.expect("execute");

        assert_eq!(resp.output["result"], "done");
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["content"], "do the thing");
    }
}
