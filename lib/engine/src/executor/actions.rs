//! Human action handlers: approve, reject (with rollback), edit,
//! submit input, retry, and the one-shot diagnostic agent invocation.

use super::{object, FlowExecutor};
use crate::bus::{Event, EventKind};
use crate::error::EngineError;
use flowforge_agent::{AgentRequest, AgentResponse, ExecuteOptions};
use flowforge_core::NodeRunId;
use flowforge_store::{
    FlowStatus, NodeRunRecord, NodeStatus, ReviewAction, Store,
};
use flowforge_workflow::Dag;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashSet;
use tracing::info;

impl<S: Store> FlowExecutor<S> {
    /// Requires the node to be parked for a human.
    async fn waiting_human_node(
        &self,
        node_run_id: NodeRunId,
    ) -> Result<NodeRunRecord, EngineError> {
        let node_run = self.store.node_run(node_run_id).await?;
        if node_run.status != NodeStatus::WaitingHuman {
            return Err(EngineError::InvalidNodeState {
                node_run_id,
                expected: "waiting for human action",
                actual: node_run.status,
            });
        }
        Ok(node_run)
    }

    /// Approves a human_review node: the attempt's input passes through
    /// as its output.
    pub async fn approve(&self, node_run_id: NodeRunId) -> Result<(), EngineError> {
        let node_run = self.waiting_human_node(node_run_id).await?;

        self.store
            .update_node_run_review(node_run_id, ReviewAction::Approve.as_str(), "")
            .await?;

        let mut output = match &node_run.input {
            Some(JsonValue::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if output.is_empty() {
            output.insert("approved".to_string(), json!(true));
        }
        output.insert("_review_action".to_string(), json!("approve"));

        self.store
            .update_node_run_output(node_run_id, &JsonValue::Object(output))
            .await?;
        self.store
            .update_node_run_status(node_run_id, NodeStatus::Completed)
            .await?;

        self.publish(
            Event::new(EventKind::NodeCompleted, node_run.flow_run_id)
                .for_node(node_run_id, node_run.node_id.clone())
                .with_data(object(&[("review_action", json!("approve"))])),
        );

        if let Ok(flow) = self.store.flow_run(node_run.flow_run_id).await {
            self.record_timeline(
                flow.task_id,
                node_run.flow_run_id,
                Some(node_run_id),
                "review_approved",
                json!({
                    "node_id": node_run.node_id,
                    "node_name": node_run.node_name,
                    "message": format!("Review approved: {}", node_run.node_name),
                }),
            )
            .await;
        }

        self.advance_dag(node_run.flow_run_id).await
    }

    /// Rejects a human_review node and rolls execution back to the
    /// target node with the reviewer's feedback injected.
    pub async fn reject(
        &self,
        node_run_id: NodeRunId,
        feedback: &str,
    ) -> Result<(), EngineError> {
        let node_run = self.waiting_human_node(node_run_id).await?;

        self.store
            .update_node_run_review(node_run_id, ReviewAction::Reject.as_str(), feedback)
            .await?;
        self.store
            .update_node_run_status(node_run_id, NodeStatus::Rejected)
            .await?;

        self.publish(
            Event::new(EventKind::NodeRejected, node_run.flow_run_id)
                .for_node(node_run_id, node_run.node_id.clone())
                .with_data(object(&[("feedback", json!(feedback))])),
        );

        let flow = self.store.flow_run(node_run.flow_run_id).await?;
        let (_, dag) = self.parse_snapshot(flow.id, flow.dsl_snapshot.as_deref())?;
        let node_def = self.node_def(&dag, &node_run.node_id)?;

        // Rollback target: the node's explicit goto, else its first
        // predecessor in the DAG.
        let target_node_id = node_def
            .on_reject
            .as_ref()
            .and_then(|r| r.goto.clone())
            .filter(|goto| !goto.is_empty())
            .or_else(|| dag.previous_node(&node_run.node_id).map(|n| n.id.clone()));

        let Some(target_node_id) = target_node_id else {
            let message = format!("no rollback target found for node {}", node_run.node_id);
            self.store
                .update_flow_run_error(flow.id, FlowStatus::Failed, &message)
                .await?;
            self.publish(
                Event::new(EventKind::FlowFailed, flow.id)
                    .with_data(object(&[("error", json!(message))])),
            );
            return Ok(());
        };

        let existing_target = self.store.latest_node_run(flow.id, &target_node_id).await?;

        // Loop bound on the rollback target.
        let max_loops = node_def
            .on_reject
            .as_ref()
            .map(flowforge_workflow::OnRejectDef::max_loops)
            .unwrap_or(flowforge_workflow::definition::DEFAULT_MAX_LOOPS);
        if max_loops > 0 {
            if let Some(target) = &existing_target {
                if target.attempt >= max_loops as i32 {
                    let message = format!(
                        "rejection limit reached ({max_loops}) for node {}",
                        node_run.node_id
                    );
                    self.store
                        .update_flow_run_error(flow.id, FlowStatus::Failed, &message)
                        .await?;
                    self.publish(
                        Event::new(EventKind::FlowFailed, flow.id)
                            .with_data(object(&[("error", json!(message))])),
                    );
                    return Ok(());
                }
            }
        }

        let attempt = existing_target.map_or(1, |t| t.attempt + 1);
        let target_def = self.node_def(&dag, &target_node_id)?;

        // Feedback injection for the re-pass.
        let mut input = Map::new();
        input.insert("_feedback".to_string(), json!(feedback));
        input.insert("_reject_from".to_string(), json!(node_run.node_id));
        input.insert("_attempt".to_string(), json!(attempt));
        if let Some(on_reject) = &node_def.on_reject {
            for (key, value) in &on_reject.inject {
                input.insert(key.clone(), json!(value));
            }
        }

        let rollback_run = NodeRunRecord::new(
            flow.id,
            target_def.id.clone(),
            target_def.kind,
            target_def.name.clone(),
            NodeStatus::Queued,
            attempt,
        )
        .with_input(JsonValue::Object(input));
        self.store.create_node_run(&rollback_run).await?;

        self.reset_downstream_nodes(&flow, &dag, &target_node_id, &node_run.node_id)
            .await;

        self.record_timeline(
            flow.task_id,
            node_run.flow_run_id,
            Some(node_run_id),
            "review_rejected",
            json!({
                "node_id": node_run.node_id,
                "node_name": node_run.node_name,
                "feedback": feedback,
                "rollback_to": target_node_id,
                "attempt": attempt,
                "message": format!(
                    "Review rejected: {} rolled back to {} (attempt {})",
                    node_run.node_name, target_node_id, attempt
                ),
            }),
        )
        .await;

        info!(
            from_node = %node_run.node_id,
            to_node = %target_node_id,
            attempt,
            "rejected and rolling back"
        );

        Ok(())
    }

    /// Re-creates pending attempt rows for every node strictly
    /// downstream of the rollback target, up to and including the
    /// rejected node. The visited set keeps the walk idempotent when a
    /// node has multiple parallel downstreams.
    async fn reset_downstream_nodes(
        &self,
        flow: &flowforge_store::FlowRunRecord,
        dag: &Dag,
        target_node_id: &str,
        rejected_node_id: &str,
    ) {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = vec![target_node_id.to_string()];

        while let Some(current) = stack.pop() {
            for successor_id in dag.successors(&current) {
                if !visited.insert(successor_id.clone()) {
                    continue;
                }
                let Some(successor) = dag.node(successor_id) else {
                    continue;
                };

                let attempt = match self.store.latest_node_run(flow.id, successor_id).await {
                    Ok(existing) => existing.map_or(1, |run| run.attempt + 1),
                    Err(e) => {
                        tracing::warn!(node_id = %successor_id, error = %e, "failed to look up attempt");
                        continue;
                    }
                };

                let record = NodeRunRecord::new(
                    flow.id,
                    successor.id.clone(),
                    successor.kind,
                    successor.name.clone(),
                    NodeStatus::Pending,
                    attempt,
                );
                if let Err(e) = self.store.create_node_run(&record).await {
                    tracing::warn!(node_id = %successor_id, error = %e, "failed to create re-pass node run");
                }

                // The walk stops at the rejected node; nodes beyond it
                // keep their completed state until the re-pass reaches
                // them.
                if successor_id != rejected_node_id {
                    stack.push(successor_id.clone());
                }
            }
        }
    }

    /// Approves a human_review node with edited content as its output.
    pub async fn edit(
        &self,
        node_run_id: NodeRunId,
        edited_content: &str,
        change_summary: &str,
    ) -> Result<(), EngineError> {
        let node_run = self.waiting_human_node(node_run_id).await?;

        self.store
            .update_node_run_review(
                node_run_id,
                ReviewAction::EditAndApprove.as_str(),
                change_summary,
            )
            .await?;

        let mut output = match serde_json::from_str::<Map<String, JsonValue>>(edited_content) {
            Ok(map) => map,
            Err(_) => {
                let mut map = Map::new();
                map.insert("edited_content".to_string(), json!(edited_content));
                map.insert("change_summary".to_string(), json!(change_summary));
                map
            }
        };
        output.insert("_review_action".to_string(), json!("edit_and_approve"));

        self.store
            .update_node_run_output(node_run_id, &JsonValue::Object(output))
            .await?;
        self.store
            .update_node_run_status(node_run_id, NodeStatus::Completed)
            .await?;

        self.publish(
            Event::new(EventKind::NodeCompleted, node_run.flow_run_id)
                .for_node(node_run_id, node_run.node_id.clone())
                .with_data(object(&[("review_action", json!("edit_and_approve"))])),
        );

        if let Ok(flow) = self.store.flow_run(node_run.flow_run_id).await {
            self.record_timeline(
                flow.task_id,
                node_run.flow_run_id,
                Some(node_run_id),
                "review_edited",
                json!({
                    "node_id": node_run.node_id,
                    "node_name": node_run.node_name,
                    "change_summary": change_summary,
                    "message": format!("Approved with edits: {}", node_run.node_name),
                }),
            )
            .await;
        }

        self.advance_dag(node_run.flow_run_id).await
    }

    /// Completes a human_input node with submitted data as its output.
    /// A non-object submission fails the handler without changing state.
    pub async fn submit_human_input(
        &self,
        node_run_id: NodeRunId,
        data_json: &str,
    ) -> Result<(), EngineError> {
        let node_run = self.waiting_human_node(node_run_id).await?;

        let output: Map<String, JsonValue> = serde_json::from_str(data_json)
            .map_err(|e| EngineError::InvalidHumanInput {
                message: e.to_string(),
            })?;

        self.store
            .update_node_run_output(node_run_id, &JsonValue::Object(output))
            .await?;
        self.store
            .update_node_run_status(node_run_id, NodeStatus::Completed)
            .await?;

        self.publish(
            Event::new(EventKind::NodeCompleted, node_run.flow_run_id)
                .for_node(node_run_id, node_run.node_id.clone())
                .with_data(object(&[("input_submitted", json!(true))])),
        );

        if let Ok(flow) = self.store.flow_run(node_run.flow_run_id).await {
            self.record_timeline(
                flow.task_id,
                node_run.flow_run_id,
                Some(node_run_id),
                "human_input_submitted",
                json!({
                    "node_id": node_run.node_id,
                    "node_name": node_run.node_name,
                    "message": format!("Input submitted: {}", node_run.node_name),
                }),
            )
            .await;
        }

        self.advance_dag(node_run.flow_run_id).await
    }

    /// Retries a failed node by creating a fresh queued attempt with the
    /// previous input; a failed flow resumes running.
    pub async fn retry(&self, node_run_id: NodeRunId) -> Result<(), EngineError> {
        let node_run = self.store.node_run(node_run_id).await?;
        if node_run.status != NodeStatus::Failed {
            return Err(EngineError::InvalidNodeState {
                node_run_id,
                expected: "failed",
                actual: node_run.status,
            });
        }

        let flow = self.store.flow_run(node_run.flow_run_id).await?;
        let (_, dag) = self.parse_snapshot(flow.id, flow.dsl_snapshot.as_deref())?;
        self.node_def(&dag, &node_run.node_id)?;

        let mut retry_run = NodeRunRecord::new(
            flow.id,
            node_run.node_id.clone(),
            node_run.node_kind,
            node_run.node_name.clone(),
            NodeStatus::Queued,
            node_run.attempt + 1,
        );
        retry_run.input = node_run.input.clone();
        self.store.create_node_run(&retry_run).await?;

        if flow.status == FlowStatus::Failed {
            self.store
                .update_flow_run_status(flow.id, FlowStatus::Running)
                .await?;
        }

        self.publish(
            Event::new(EventKind::NodeQueued, node_run.flow_run_id)
                .for_node(retry_run.id, node_run.node_id.clone())
                .with_data(object(&[
                    ("retry", json!(true)),
                    ("attempt", json!(retry_run.attempt)),
                ])),
        );

        Ok(())
    }

    /// One-shot adapter invocation bypassing the queue, for operator
    /// diagnostics.
    pub async fn test_agent(
        &self,
        role: &str,
        mode: &str,
        prompt: &str,
    ) -> Result<AgentResponse, EngineError> {
        let (adapter, model) = self.registry.adapter_for_role(role)?;

        let mut context = Map::new();
        context.insert("_role".to_string(), json!(role));

        let request = AgentRequest {
            task_id: "test".to_string(),
            node_id: "test".to_string(),
            mode: mode.to_string(),
            prompt: prompt.to_string(),
            context,
            model: model.unwrap_or_default(),
            ..Default::default()
        };

        Ok(adapter.execute(&request, &ExecuteOptions::new()).await?)
    }
}
