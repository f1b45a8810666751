//! Flow lifecycle: start, cancel, and DAG advancement.

use super::{object, FlowExecutor};
use crate::bus::{Event, EventKind};
use crate::error::EngineError;
use flowforge_core::FlowRunId;
use flowforge_store::{FlowStatus, NodeRunRecord, NodeStatus, Store};
use flowforge_workflow::{render_params, Dag};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

impl<S: Store> FlowExecutor<S> {
    /// Initializes a flow run: substitutes parameters, parses the DSL,
    /// persists the snapshot, and creates one node run per DAG node
    /// (entries queued, others pending).
    pub async fn start_flow(
        &self,
        flow_run_id: FlowRunId,
        dsl: &str,
        params: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        // Substitute {{ params.x }} before parsing so the stored
        // snapshot is the literal workflow that executes.
        let rendered = render_params(dsl, &params);

        let (workflow, dag) = Dag::parse(&rendered)?;

        let flow = self.store.flow_run(flow_run_id).await?;

        self.store
            .save_dsl_snapshot(flow_run_id, &rendered, &params)
            .await?;
        self.store
            .update_flow_run_status(flow_run_id, FlowStatus::Running)
            .await?;

        let entry_ids: HashSet<&str> = dag
            .entry_nodes()
            .into_iter()
            .map(|node| node.id.as_str())
            .collect();

        for node_id in dag.order() {
            let Some(node) = dag.node(node_id) else {
                continue;
            };
            let status = if entry_ids.contains(node_id.as_str()) {
                NodeStatus::Queued
            } else {
                NodeStatus::Pending
            };

            let record = NodeRunRecord::new(
                flow_run_id,
                node.id.clone(),
                node.kind,
                node.name.clone(),
                status,
                1,
            );
            self.store.create_node_run(&record).await?;

            info!(
                node_run_id = %record.id,
                node_id = %node.id,
                status = %status,
                "created node run"
            );
        }

        self.publish(
            Event::new(EventKind::FlowStarted, flow_run_id).with_data(object(&[
                ("workflow_name", json!(workflow.name)),
                ("node_count", json!(dag.node_count())),
            ])),
        );

        self.record_timeline(
            flow.task_id,
            flow_run_id,
            None,
            "flow_started",
            json!({
                "message": format!("Flow started: {}", workflow.name),
                "workflow_name": workflow.name,
            }),
        )
        .await;

        Ok(())
    }

    /// Cancels a running flow: refuses on terminal flows, cancels every
    /// pending/queued node run, and fires the per-flow cancel handle so
    /// an in-flight container is torn down promptly.
    pub async fn cancel_flow(&self, flow_run_id: FlowRunId) -> Result<(), EngineError> {
        let flow = self.store.flow_run(flow_run_id).await?;

        if flow.status == FlowStatus::Completed || flow.status == FlowStatus::Cancelled {
            return Err(EngineError::FlowNotCancellable {
                flow_run_id,
                status: flow.status,
            });
        }

        self.store.cancel_pending_node_runs(flow_run_id).await?;
        self.store
            .update_flow_run_status(flow_run_id, FlowStatus::Cancelled)
            .await?;

        self.fire_cancel(flow_run_id);

        self.publish(Event::new(EventKind::FlowCancelled, flow_run_id));

        self.record_timeline(
            flow.task_id,
            flow_run_id,
            None,
            "flow_cancelled",
            json!({"message": "Flow cancelled"}),
        )
        .await;

        Ok(())
    }

    /// Activates downstream nodes whose predecessors have all completed,
    /// and completes the flow once every node's latest attempt is
    /// completed.
    ///
    /// Input propagation: predecessor outputs are gathered into a fresh
    /// map keyed by predecessor node id; a single-predecessor node also
    /// gets that predecessor's output fields flattened onto the top
    /// level. DSL authors must not give an output field the same name as
    /// the producing node's id — the collision is not detected.
    pub async fn advance_dag(&self, flow_run_id: FlowRunId) -> Result<(), EngineError> {
        let flow = self.store.flow_run(flow_run_id).await?;
        let (_, dag) = self.parse_snapshot(flow_run_id, flow.dsl_snapshot.as_deref())?;

        let completed = self.store.completed_node_ids(flow_run_id).await?;
        let pending = self.store.pending_node_runs(flow_run_id).await?;

        for pending_run in pending {
            let deps = dag.dependencies(&pending_run.node_id);
            let all_deps_completed = deps.iter().all(|dep| completed.contains(dep));
            if !all_deps_completed {
                continue;
            }

            match self.resolve_node_input(flow_run_id, &dag, &pending_run.node_id).await {
                Ok(Some(input)) => {
                    if let Err(e) = self
                        .store
                        .update_node_run_input(pending_run.id, &JsonValue::Object(input))
                        .await
                    {
                        warn!(node_id = %pending_run.node_id, error = %e, "failed to update node input");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(node_id = %pending_run.node_id, error = %e, "failed to resolve node input");
                }
            }

            self.store
                .update_node_run_status(pending_run.id, NodeStatus::Queued)
                .await?;

            info!(node_id = %pending_run.node_id, flow_run_id = %flow_run_id, "activated node");
            self.publish(
                Event::new(EventKind::NodeQueued, flow_run_id)
                    .for_node(pending_run.id, pending_run.node_id.clone()),
            );
        }

        if self.store.all_nodes_completed(flow_run_id).await? {
            self.store
                .update_flow_run_status(flow_run_id, FlowStatus::Completed)
                .await?;

            self.publish(Event::new(EventKind::FlowCompleted, flow_run_id));

            self.record_timeline(
                flow.task_id,
                flow_run_id,
                None,
                "flow_completed",
                json!({"message": "Flow completed"}),
            )
            .await;

            info!(flow_run_id = %flow_run_id, "flow completed");
        }

        Ok(())
    }

    /// Collects upstream outputs as the input for a node about to be
    /// activated.
    async fn resolve_node_input(
        &self,
        flow_run_id: FlowRunId,
        dag: &Dag,
        node_id: &str,
    ) -> Result<Option<Map<String, JsonValue>>, EngineError> {
        let deps = dag.dependencies(node_id);
        if deps.is_empty() {
            return Ok(None);
        }

        let mut input = Map::new();

        for dep in deps {
            let Some(dep_run) = self.store.latest_node_run(flow_run_id, dep).await? else {
                continue;
            };
            if let Some(JsonValue::Object(output)) = dep_run.output {
                input.insert(dep.clone(), JsonValue::Object(output));
            }
        }

        // Single-predecessor convenience for linear chains: the upstream
        // fields are also reachable without the node-id prefix.
        if deps.len() == 1 {
            if let Some(JsonValue::Object(upstream)) = input.get(&deps[0]).cloned() {
                for (key, value) in upstream {
                    input.insert(key, value);
                }
            }
        }

        Ok(Some(input))
    }
}
