//! Type adapter for the Codex CLI agent image.

use crate::adapter::{ExecutorRequest, ExecutorResponse, TypeAdapter};
use crate::error::AgentError;
use crate::prompt::PromptBuilder;
use crate::types::{AgentRequest, AgentResponse};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default image for the Codex agent.
const DEFAULT_IMAGE: &str = "flowforge/agent-codex:latest";

/// Provider-level configuration for the Codex adapter.
#[derive(Debug, Clone, Default)]
pub struct CodexConfig {
    /// OpenAI API key handed to the container.
    pub api_key: String,
    /// Custom provider base URL.
    pub base_url: String,
    /// Default model when the request carries none.
    pub model: String,
    /// Container image override.
    pub image: String,
    /// Execution timeout override.
    pub timeout: Option<Duration>,
}

/// Semantic layer for the Codex CLI.
pub struct CodexAdapter {
    prompt_builder: Arc<PromptBuilder>,
    config: CodexConfig,
}

impl CodexAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(prompt_builder: Arc<PromptBuilder>, config: CodexConfig) -> Self {
        Self {
            prompt_builder,
            config,
        }
    }

    fn image(&self) -> String {
        if self.config.image.is_empty() {
            std::env::var("CODEX_DOCKER_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string())
        } else {
            self.config.image.clone()
        }
    }
}

#[async_trait]
impl TypeAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    async fn build_request(&self, req: &AgentRequest) -> Result<ExecutorRequest, AgentError> {
        let prompt = self.prompt_builder.build(req);

        let mut env = HashMap::new();
        env.insert("AGENT_PROMPT".to_string(), prompt);
        env.insert("AGENT_MODE".to_string(), req.mode.clone());
        env.insert("TASK_ID".to_string(), req.task_id.clone());
        env.insert("NODE_ID".to_string(), req.node_id.clone());

        if !self.config.api_key.is_empty() {
            env.insert("OPENAI_API_KEY".to_string(), self.config.api_key.clone());
        } else if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            env.insert("OPENAI_API_KEY".to_string(), v);
        }

        // Model selection: request override wins over the provider default.
        let model = if req.model.is_empty() {
            &self.config.model
        } else {
            &req.model
        };
        if !model.is_empty() {
            env.insert("CODEX_MODEL".to_string(), model.clone());
        }

        if !self.config.base_url.is_empty() {
            env.insert(
                "CODEX_PROVIDER_BASE_URL".to_string(),
                self.config.base_url.clone(),
            );
            env.insert("CODEX_MODEL_PROVIDER".to_string(), "custom".to_string());
        }

        // Git configuration. The base branch is what the agent forks
        // from; the feature branch is derived when the task has none.
        if !req.git_repo_url.is_empty() {
            env.insert("GIT_REPO_URL".to_string(), req.git_repo_url.clone());
        }
        let base_branch = if req.git_branch.is_empty() {
            "main"
        } else {
            &req.git_branch
        };
        env.insert("GIT_BRANCH".to_string(), base_branch.to_string());
        env.insert("GIT_BASE_BRANCH".to_string(), base_branch.to_string());

        let mut feature_branch = req.git_branch.clone();
        if feature_branch.is_empty() || feature_branch == "main" {
            feature_branch = match &req.opsx {
                Some(opsx) if !opsx.change_name.is_empty() => {
                    format!("agent/{}", opsx.change_name)
                }
                _ => derive_feature_branch(&req.task_title),
            };
        }
        env.insert("GIT_FEATURE_BRANCH".to_string(), feature_branch);

        env.insert("GIT_CREATE_PR".to_string(), "true".to_string());
        env.insert("GIT_PR_TITLE".to_string(), req.task_title.clone());
        if !req.git_access_token.is_empty() {
            env.insert("GIT_ACCESS_TOKEN".to_string(), req.git_access_token.clone());
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
            command: Vec::new(),
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

        let output = match serde_json::from_str::<Map<String, JsonValue>>(&resp.stdout) {
            Ok(map) => map,
            Err(_) => {
                let mut map = Map::new();
                map.insert("result".to_string(), JsonValue::String(resp.stdout.clone()));
                map.insert("raw".to_string(), JsonValue::Bool(true));
                map.insert(
                    "summary".to_string(),
                    JsonValue::String("Codex execution completed".to_string()),
                );
                map
            }
        };

        Ok(AgentResponse {
            output,
            metrics: None,
            git_metadata: resp.git_metadata.clone(),
        })
    }
}

/// Derives a feature branch name from a task title: lowercased,
/// non-alphanumerics collapsed to dashes, truncated.
fn derive_feature_branch(task_title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for c in task_title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "agent/task".to_string()
    } else {
        format!("agent/{slug}")
    }
}
