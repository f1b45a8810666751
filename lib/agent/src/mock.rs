//! Mock adapter returning simulated agent responses.
//!
//! Used when no container runtime or credentials are available, and by
//! operators exercising a workflow end-to-end without spending tokens.

use crate::adapter::{Adapter, ExecuteOptions};
use crate::error::AgentError;
use crate::types::{AgentRequest, AgentResponse, ExecutionMetrics};
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};

/// Returns canned, mode-shaped outputs after a short cancellable delay.
pub struct MockAdapter {
    delay: Duration,
}

impl MockAdapter {
    /// Creates a mock with the default simulated delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay: Duration::from_secs(2),
        }
    }

    /// Overrides the simulated delay.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        req: &AgentRequest,
        opts: &ExecuteOptions,
    ) -> Result<AgentResponse, AgentError> {
        let start = Instant::now();

        tokio::select! {
            () = tokio::time::sleep(self.delay) => {}
            () = opts.cancel.cancelled() => return Err(AgentError::Cancelled),
        }

        opts.emit(json!({
            "type": "assistant",
            "content": format!("[mock] finished node '{}' in mode '{}'", req.node_id, req.mode),
        }));

        let output = match req.mode.as_str() {
            "spec" => json!({
                "plan": format!("[Mock] Implementation plan for node '{}'", req.node_id),
                "files": ["src/main.ts", "src/utils.ts"],
                "estimate": "2 hours",
                "summary": "Mock spec output.",
            }),
            "execute" => json!({
                "result": format!("[Mock] Execution completed for node '{}'", req.node_id),
                "changed_files": ["src/main.ts"],
                "summary": "Mock execution output.",
            }),
            "review" => json!({
                "passed": true,
                "issues": [],
                "report": format!("[Mock] Code review passed for node '{}'.", req.node_id),
                "summary": "Mock review output.",
            }),
            other => json!({
                "result": format!(
                    "[Mock] Agent task completed for node '{}' (mode: {other})",
                    req.node_id
                ),
                "summary": "Default mock output.",
            }),
        };

        let output = output
            .as_object()
            .cloned()
            .unwrap_or_default();

        Ok(AgentResponse {
            output,
            metrics: Some(ExecutionMetrics {
                token_input: 1200,
                token_output: 3500,
                duration_ms: start.elapsed().as_millis() as i64,
            }),
            git_metadata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn spec_mode_returns_plan() {
        let adapter = MockAdapter::with_delay(Duration::from_millis(5));
        let req = AgentRequest {
            node_id: "plan".to_string(),
            mode: "spec".to_string(),
            ..Default::default()
        };

        let resp = adapter.execute(&req, &ExecuteOptions::new()).await.expect("execute");
        assert!(resp.output.contains_key("plan"));
        assert!(resp.metrics.is_some());
    }

    #[tokio::test]
    async fn cancellation_interrupts_delay() {
        let adapter = MockAdapter::with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let opts = ExecuteOptions::new().with_cancel(cancel.clone());

        let handle = tokio::spawn(async move {
            adapter.execute(&AgentRequest::default(), &opts).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = handle.await.expect("join").unwrap_err();
        assert!(err.is_cancelled());
    }
}
