//! Type adapter for the Claude Code CLI agent image.

use crate::adapter::{ExecutorRequest, ExecutorResponse, TypeAdapter};
use crate::error::AgentError;
use crate::prompt::PromptBuilder;
use crate::types::{AgentRequest, AgentResponse, ExecutionMetrics};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default image for the Claude Code agent.
const DEFAULT_IMAGE: &str = "flowforge/agent-claude:latest";

/// Provider-level configuration for the Claude Code adapter.
#[derive(Debug, Clone, Default)]
pub struct ClaudeConfig {
    /// Anthropic auth token handed to the container.
    pub auth_token: String,
    /// Alternate API base URL.
    pub base_url: String,
    /// Default model when the request carries none.
    pub model: String,
    /// Container image override.
    pub image: String,
    /// Execution timeout override.
    pub timeout: Option<Duration>,
}

/// Semantic layer for the Claude Code CLI: composes the prompt and env,
/// parses the CLI's JSON output.
pub struct ClaudeCodeAdapter {
    prompt_builder: Arc<PromptBuilder>,
    config: ClaudeConfig,
}

impl ClaudeCodeAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(prompt_builder: Arc<PromptBuilder>, config: ClaudeConfig) -> Self {
        Self {
            prompt_builder,
            config,
        }
    }

    fn image(&self) -> String {
        if self.config.image.is_empty() {
            std::env::var("AGENT_DOCKER_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string())
        } else {
            self.config.image.clone()
        }
    }
}

#[async_trait]
impl TypeAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn build_request(&self, req: &AgentRequest) -> Result<ExecutorRequest, AgentError> {
        let prompt = self.prompt_builder.build(req);

        let mut env = HashMap::new();
        env.insert("AGENT_PROMPT".to_string(), prompt);
        env.insert("AGENT_MODE".to_string(), req.mode.clone());
        env.insert("TASK_ID".to_string(), req.task_id.clone());
        env.insert("NODE_ID".to_string(), req.node_id.clone());

        // Credentials: provider config first, then process env.
        if !self.config.auth_token.is_empty() {
            env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), self.config.auth_token.clone());
        } else if let Ok(v) = std::env::var("ANTHROPIC_AUTH_TOKEN") {
            env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            env.insert("ANTHROPIC_API_KEY".to_string(), v);
        }
        if !self.config.base_url.is_empty() {
            env.insert("ANTHROPIC_BASE_URL".to_string(), self.config.base_url.clone());
        } else if let Ok(v) = std::env::var("ANTHROPIC_BASE_URL") {
            env.insert("ANTHROPIC_BASE_URL".to_string(), v);
        }

        // Git configuration.
        if !req.git_repo_url.is_empty() {
            env.insert("GIT_REPO_URL".to_string(), req.git_repo_url.clone());
        }
        let branch = if req.git_branch.is_empty() {
            "main"
        } else {
            &req.git_branch
        };
        env.insert("GIT_BRANCH".to_string(), branch.to_string());
        if !req.git_access_token.is_empty() {
            env.insert("GIT_ACCESS_TOKEN".to_string(), req.git_access_token.clone());
        }

        // Model selection: request override wins over the provider default.
        let model = if req.model.is_empty() {
            &self.config.model
        } else {
            &req.model
        };
        if !model.is_empty() {
            env.insert("CLAUDE_MODEL".to_string(), model.clone());
        }

        // OpenSpec configuration for the opsx modes.
        if req.mode == "opsx_plan" || req.mode == "opsx_apply" {
            if let Some(opsx) = &req.opsx {
                env.insert("OPSX_CHANGE_NAME".to_string(), opsx.change_name.clone());
                if !opsx.schema.is_empty() {
                    env.insert("OPSX_SCHEMA".to_string(), opsx.schema.clone());
                }
                env.insert(
                    "OPSX_INIT_IF_MISSING".to_string(),
                    opsx.init_if_missing.to_string(),
                );
                if !opsx.action.is_empty() {
                    env.insert("OPSX_ACTION".to_string(), opsx.action.clone());
                }
            }
        }

        Ok(ExecutorRequest {
            image: self.image(),
            command: Vec::new(), // image entrypoint
            env,
            work_dir: "/workspace".to_string(),
            timeout: self.config.timeout.unwrap_or(Duration::ZERO),
        })
    }

    fn parse_response(&self, resp: &ExecutorResponse) -> Result<AgentResponse, AgentError> {
        if resp.exit_code != 0 {
            return Err(AgentError::ExecutionFailed {
                exit_code: resp.exit_code,
                stderr: resp.stderr.clone(),
            });
        }

        let Ok(parsed) = serde_json::from_str::<ClaudeOutput>(&resp.stdout) else {
            // Not valid JSON; wrap the raw output.
            let mut output = Map::new();
            output.insert("result".to_string(), JsonValue::String(resp.stdout.clone()));
            output.insert("raw".to_string(), JsonValue::Bool(true));
            output.insert(
                "summary".to_string(),
                JsonValue::String("Agent execution completed (non-JSON output)".to_string()),
            );
            return Ok(AgentResponse {
                output,
                metrics: Some(ExecutionMetrics::default()),
                git_metadata: resp.git_metadata.clone(),
            });
        };

        let mut output = parsed.result.unwrap_or_default();
        if !parsed.summary.is_empty() {
            output.insert("summary".to_string(), JsonValue::String(parsed.summary));
        }
        if !parsed.changed_files.is_empty() {
            output.insert(
                "changed_files".to_string(),
                JsonValue::Array(
                    parsed
                        .changed_files
                        .into_iter()
                        .map(JsonValue::String)
                        .collect(),
                ),
            );
        }
        if !parsed.plan.is_empty() {
            output.insert("plan".to_string(), JsonValue::String(parsed.plan));
        }
        if !parsed.report.is_empty() {
            output.insert("report".to_string(), JsonValue::String(parsed.report));
        }
        if let Some(passed) = parsed.passed {
            output.insert("passed".to_string(), JsonValue::Bool(passed));
        }
        if !parsed.issues.is_empty() {
            output.insert("issues".to_string(), JsonValue::Array(parsed.issues));
        }

        Ok(AgentResponse {
            output,
            metrics: Some(ExecutionMetrics {
                token_input: parsed.tokens_in,
                token_output: parsed.tokens_out,
                duration_ms: parsed.duration_ms,
            }),
            git_metadata: resp.git_metadata.clone(),
        })
    }
}

/// JSON output shape of the Claude Code CLI.
#[derive(Debug, Default, Deserialize)]
struct ClaudeOutput {
    #[serde(default)]
    result: Option<Map<String, JsonValue>>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    plan: String,
    #[serde(default)]
    report: String,
    #[serde(default)]
    changed_files: Vec<String>,
    #[serde(default)]
    passed: Option<bool>,
    #[serde(default)]
    issues: Vec<JsonValue>,
    #[serde(default)]
    tokens_in: i64,
    #[serde(default)]
    tokens_out: i64,
    #[serde(default)]
    duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ClaudeCodeAdapter {
        ClaudeCodeAdapter::new(
            Arc::new(PromptBuilder::new()),
            ClaudeConfig {
                model: "claude-sonnet".to_string(),
                image: "test/agent:1".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn build_request_wires_env() {
        let req = AgentRequest {
            task_id: "nrun_1".to_string(),
            node_id: "implement".to_string(),
            mode: "execute".to_string(),
            prompt: "do it".to_string(),
            git_repo_url: "https://tok@github.com/acme/widgets.git".to_string(),
            git_branch: "feature/login".to_string(),
            ..Default::default()
        };

        let exec_req = adapter().build_request(&req).await.expect("build");

        assert_eq!(exec_req.image, "test/agent:1");
        assert_eq!(exec_req.work_dir, "/workspace");
        assert!(exec_req.command.is_empty());
        assert_eq!(exec_req.env["AGENT_MODE"], "execute");
        assert_eq!(exec_req.env["GIT_BRANCH"], "feature/login");
        assert_eq!(exec_req.env["CLAUDE_MODEL"], "claude-sonnet");
        assert!(exec_req.env["AGENT_PROMPT"].contains("do it"));
    }

    #[tokio::test]
    async fn branch_defaults_to_main() {
        let req = AgentRequest::default();
        let exec_req = adapter().build_request(&req).await.expect("build");
        assert_eq!(exec_req.env["GIT_BRANCH"], "main");
    }

    #[tokio::test]
    async fn request_model_overrides_provider_default() {
        let req = AgentRequest {
            model: "claude-opus".to_string(),
            ..Default::default()
        };
        let exec_req = adapter().build_request(&req).await.expect("build");
        assert_eq!(exec_req.env["CLAUDE_MODEL"], "claude-opus");
    }

    #[test]
    fn parse_structured_output() {
        let resp = ExecutorResponse {
            exit_code: 0,
            stdout: r#"{
                "result": {"text": "done"},
                "summary": "implemented the login form",
                "changed_files": ["src/login.ts"],
                "passed": true,
                "tokens_in": 100,
                "tokens_out": 350,
                "duration_ms": 4200
            }"#
            .to_string(),
            ..Default::default()
        };

        let parsed = adapter().parse_response(&resp).expect("parse");
        assert_eq!(parsed.output["text"], "done");
        assert_eq!(parsed.output["summary"], "implemented the login form");
        assert_eq!(parsed.output["passed"], true);
        let metrics = parsed.metrics.expect("metrics");
        assert_eq!(metrics.token_output, 350);
    }

    #[test]
    fn parse_wraps_non_json_output() {
        let resp = ExecutorResponse {
            exit_code: 0,
            stdout: "I changed the files you asked about.".to_string(),
            ..Default::default()
        };

        let parsed = adapter().parse_response(&resp).expect("parse");
        assert_eq!(parsed.output["raw"], true);
        assert_eq!(parsed.output["result"], "I changed the files you asked about.");
    }

    #[test]
    fn parse_nonzero_exit_is_failure() {
        let resp = ExecutorResponse {
            exit_code: 3,
            stderr: "credentials missing".to_string(),
            ..Default::default()
        };

        let err = adapter().parse_response(&resp).unwrap_err();
        match err {
            AgentError::ExecutionFailed { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("credentials missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
