//! Dispatch of agent_task nodes.

use super::{object, FlowExecutor};
use crate::artifacts::{delivered_content, fetch_file_from_repo, infer_artifact, is_markdown};
use crate::bus::{Event, EventKind};
use crate::error::EngineError;
use flowforge_agent::{
    AgentRequest, AgentResponse, ExecuteOptions, GitMetadata, OpsxConfig,
};
use flowforge_store::{FlowRunRecord, NodeRunRecord, NodeStatus, Store, TaskGitInfo};
use flowforge_workflow::{render, NodeDef};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default role when the node declares none.
const DEFAULT_ROLE: &str = "general-developer";

impl<S: Store> FlowExecutor<S> {
    /// Runs an agent_task node: builds the runtime context and request,
    /// executes the adapter, persists the log stream, and on success
    /// records git/artifact side effects and completes the node.
    pub(super) async fn execute_agent_task(
        &self,
        node_run: &NodeRunRecord,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let flow = self.store.flow_run(node_run.flow_run_id).await?;
        let (_, dag) = self.parse_snapshot(flow.id, flow.dsl_snapshot.as_deref())?;
        let node_def = self.node_def(&dag, &node_run.node_id)?;

        // Input context of this attempt.
        let mut context = match &node_run.input {
            Some(JsonValue::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let feedback = context
            .get("_feedback")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();

        // Git metadata for the task; absence is survivable.
        let git = match self.store.task_git_info(flow.task_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(task_id = %flow.task_id, error = %e, "failed to get git info");
                TaskGitInfo::default()
            }
        };

        let template_ctx = self.build_template_context(&flow, &git, &feedback).await?;

        // Role may itself be a template.
        let raw_role = node_def
            .agent
            .as_ref()
            .map(|agent| agent.role.clone())
            .filter(|role| !role.is_empty())
            .unwrap_or_else(|| DEFAULT_ROLE.to_string());
        let role = render(&raw_role, &template_ctx).unwrap_or(raw_role);

        // Role configuration from the store: system prompt + model
        // default. Missing roles fall back to adapter built-ins.
        let role_config = match self.store.agent_role_config(&role).await {
            Ok(config) => config,
            Err(e) => {
                warn!(role = %role, error = %e, "failed to load role config");
                None
            }
        };

        let (adapter, registry_model) = match self.registry.adapter_for_role(&role) {
            Ok(resolved) => resolved,
            Err(primary_err) => {
                let fallback = node_def
                    .agent
                    .as_ref()
                    .and_then(|agent| agent.fallback_role.as_deref());
                match fallback {
                    Some(fallback_role) => self.registry.adapter_for_role(fallback_role)?,
                    None => return Err(primary_err.into()),
                }
            }
        };

        let config = node_def.config.as_ref();
        let mode = config
            .and_then(|c| c.mode.clone())
            .unwrap_or_else(|| "execute".to_string());
        let prompt_template = config
            .and_then(|c| c.prompt_template.clone())
            .unwrap_or_default();
        // A template that fails to render falls back to its raw text.
        let prompt = render(&prompt_template, &template_ctx).unwrap_or(prompt_template);

        let model = node_def
            .agent
            .as_ref()
            .and_then(|agent| agent.model.clone())
            .or(registry_model)
            .or_else(|| role_config.as_ref().and_then(|c| c.default_model.clone()))
            .unwrap_or_default();
        let role_prompt = role_config
            .and_then(|c| c.system_prompt)
            .unwrap_or_default();

        context.insert("_role".to_string(), json!(role));

        let request = AgentRequest {
            task_id: node_run.id.to_string(),
            flow_run_id: node_run.flow_run_id.to_string(),
            node_id: node_run.node_id.clone(),
            mode: mode.clone(),
            prompt,
            context,
            work_dir: String::new(),
            git_repo_url: git.repo_url.clone(),
            git_branch: git.base_branch.clone(),
            git_access_token: git.access_token.clone(),
            task_title: git.title.clone(),
            node_name: node_run.node_name.clone(),
            role_prompt,
            feedback,
            model,
            opsx: config.and_then(|c| c.opsx.as_ref()).map(|opsx| OpsxConfig {
                change_name: opsx.change_name.clone(),
                schema: opsx.schema.clone().unwrap_or_default(),
                init_if_missing: opsx.init_if_missing,
                action: opsx.action.clone().unwrap_or_default(),
            }),
        };

        info!(
            node_id = %node_run.node_id,
            role = %role,
            mode = %mode,
            adapter = adapter.name(),
            "executing agent task"
        );

        // Stream structured events to the bus while buffering them for
        // persistence.
        let log_buffer: Arc<Mutex<Vec<JsonValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log_buffer.clone();
        let bus = Arc::clone(self.bus());
        let event_flow = node_run.flow_run_id;
        let event_node_run = node_run.id;
        let event_node = node_run.node_id.clone();
        let opts = ExecuteOptions::new()
            .with_cancel(cancel.clone())
            .with_event_callback(Arc::new(move |event: JsonValue| {
                sink.lock().expect("log buffer poisoned").push(event.clone());
                let data = match event {
                    JsonValue::Object(map) => map,
                    other => object(&[("event", other)]),
                };
                bus.publish(
                    Event::new(EventKind::NodeLogStream, event_flow)
                        .for_node(event_node_run, event_node.clone())
                        .with_data(data),
                );
            }));

        let result = adapter.execute(&request, &opts).await;

        // Persist the buffered log stream regardless of the outcome.
        let events = log_buffer.lock().expect("log buffer poisoned").clone();
        if !events.is_empty() {
            if let Err(e) = self
                .store
                .update_node_run_log_stream(node_run.id, &events)
                .await
            {
                warn!(node_run_id = %node_run.id, error = %e, "failed to persist log stream");
            }
        }

        let response = result?;

        if let Some(metadata) = &response.git_metadata {
            self.record_git_side_effects(&flow, node_run, metadata).await;
            self.capture_artifacts(&flow, node_run, node_def, &git, metadata, &response)
                .await;
        }

        self.store
            .update_node_run_output(node_run.id, &JsonValue::Object(response.output.clone()))
            .await?;
        self.store
            .update_node_run_status(node_run.id, NodeStatus::Completed)
            .await?;

        self.publish(
            Event::new(EventKind::NodeCompleted, node_run.flow_run_id)
                .for_node(node_run.id, node_run.node_id.clone())
                .with_data(object(&[(
                    "output",
                    JsonValue::Object(response.output.clone()),
                )])),
        );

        self.record_timeline(
            flow.task_id,
            node_run.flow_run_id,
            Some(node_run.id),
            "agent_completed",
            json!({
                "node_id": node_run.node_id,
                "node_name": node_run.node_name,
                "mode": mode,
                "role": role,
                "output": JsonValue::Object(response.output),
            }),
        )
        .await;

        Ok(())
    }

    /// Builds the runtime template context: `params`, `nodes.<id>.outputs`,
    /// `review.comment`, and `task.*`.
    async fn build_template_context(
        &self,
        flow: &FlowRunRecord,
        git: &TaskGitInfo,
        feedback: &str,
    ) -> Result<JsonValue, EngineError> {
        let outputs = self.store.all_node_run_outputs(flow.id).await?;

        let mut nodes = Map::new();
        for (node_id, output) in outputs {
            nodes.insert(node_id, json!({ "outputs": output }));
        }

        Ok(json!({
            "params": flow.variables.clone().unwrap_or_else(|| json!({})),
            "nodes": nodes,
            "review": { "comment": feedback },
            "task": {
                "id": flow.task_id.to_string(),
                "title": git.title,
                "slug": git.title,
            },
        }))
    }

    /// Records branch/PR side effects from the git side-channel.
    /// Best-effort throughout.
    async fn record_git_side_effects(
        &self,
        flow: &FlowRunRecord,
        node_run: &NodeRunRecord,
        metadata: &GitMetadata,
    ) {
        if !metadata.branch.is_empty() {
            if let Err(e) = self
                .store
                .update_task_git_branch(flow.task_id, &metadata.branch)
                .await
            {
                warn!(task_id = %flow.task_id, error = %e, "failed to update task branch");
            }

            self.record_timeline(
                flow.task_id,
                flow.id,
                Some(node_run.id),
                "git_pushed",
                json!({
                    "branch": metadata.branch,
                    "commit": metadata.commit,
                    "commit_message": metadata.commit_message,
                    "changed_files": metadata.changed_files,
                }),
            )
            .await;
        }

        if !metadata.pr_url.is_empty() || metadata.pr_number.is_some() {
            self.record_timeline(
                flow.task_id,
                flow.id,
                Some(node_run.id),
                "pr_created",
                json!({
                    "pr_url": metadata.pr_url,
                    "pr_number": metadata.pr_number,
                }),
            )
            .await;
        }

        if let Err(e) = self
            .store
            .update_flow_run_pr(flow.id, &metadata.branch, &metadata.pr_url, metadata.pr_number)
            .await
        {
            warn!(flow_run_id = %flow.id, error = %e, "failed to update flow PR fields");
        }
    }

    /// Records markdown outputs as versioned artifacts. Best-effort.
    async fn capture_artifacts(
        &self,
        flow: &FlowRunRecord,
        node_run: &NodeRunRecord,
        node_def: &NodeDef,
        git: &TaskGitInfo,
        metadata: &GitMetadata,
        response: &AgentResponse,
    ) {
        let repo_url = if metadata.repo_url.is_empty() {
            git.repo_url.clone()
        } else {
            metadata.repo_url.clone()
        };
        for path in &metadata.changed_files {
            if !is_markdown(path) {
                continue;
            }

            let inferred = infer_artifact(path);
            // The node's declared artifact type wins over the inferred
            // one when the DSL names it.
            let artifact_type = node_def
                .config
                .as_ref()
                .and_then(|c| c.artifact.as_ref())
                .map(|a| a.r#type.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or(inferred.artifact_type);

            let content = match delivered_content(&response.output, &artifact_type) {
                Some(delivered) => delivered.to_string(),
                None => match fetch_file_from_repo(&repo_url, &metadata.branch, path).await {
                    Some(fetched) => fetched,
                    None => continue,
                },
            };

            let artifact_id = match self
                .store
                .create_artifact(flow.task_id, &artifact_type, &inferred.title, path)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to create artifact");
                    continue;
                }
            };

            if let Err(e) = self
                .store
                .create_artifact_version(artifact_id, 1, &content, "", &node_run.node_id)
                .await
            {
                warn!(path = %path, error = %e, "failed to create artifact version");
                continue;
            }

            self.record_timeline(
                flow.task_id,
                flow.id,
                Some(node_run.id),
                "artifact_created",
                json!({
                    "artifact_id": artifact_id.to_string(),
                    "type": artifact_type,
                    "title": inferred.title,
                    "file_path": path,
                }),
            )
            .await;
        }
    }
}
