//! Dispatch of human_review and human_input nodes.
//!
//! Both transition the node to `waiting_human` and return immediately;
//! the worker is released and no routine blocks. The human acts later
//! through the control API, which drives the node to a terminal state.

use super::{object, FlowExecutor};
use crate::bus::{Event, EventKind};
use crate::error::EngineError;
use flowforge_store::{NodeRunRecord, NodeStatus, Store};
use serde_json::{json, Value as JsonValue};

impl<S: Store> FlowExecutor<S> {
    /// Parks a human_review node, surfacing the attempt's input as the
    /// artifact under review.
    pub(super) async fn execute_human_review(
        &self,
        node_run: &NodeRunRecord,
    ) -> Result<(), EngineError> {
        self.store
            .update_node_run_status(node_run.id, NodeStatus::WaitingHuman)
            .await?;

        let review_target = node_run.input.clone().unwrap_or(JsonValue::Null);

        self.publish(
            Event::new(EventKind::NodeWaitingHuman, node_run.flow_run_id)
                .for_node(node_run.id, node_run.node_id.clone())
                .with_data(object(&[
                    ("review_target", review_target),
                    ("node_name", json!(node_run.node_name)),
                ])),
        );

        if let Ok(flow) = self.store.flow_run(node_run.flow_run_id).await {
            self.record_timeline(
                flow.task_id,
                node_run.flow_run_id,
                Some(node_run.id),
                "waiting_review",
                json!({
                    "node_id": node_run.node_id,
                    "node_name": node_run.node_name,
                    "message": format!("Waiting for review: {}", node_run.node_name),
                }),
            )
            .await;
        }

        Ok(())
    }

    /// Parks a human_input node, surfacing the node's declared form
    /// schema.
    pub(super) async fn execute_human_input(
        &self,
        node_run: &NodeRunRecord,
    ) -> Result<(), EngineError> {
        self.store
            .update_node_run_status(node_run.id, NodeStatus::WaitingHuman)
            .await?;

        let flow = self.store.flow_run(node_run.flow_run_id).await?;

        // The form schema lives in the node definition; a missing or
        // unparsable snapshot degrades to an empty form.
        let form = self
            .parse_snapshot(flow.id, flow.dsl_snapshot.as_deref())
            .ok()
            .and_then(|(_, dag)| {
                dag.node(&node_run.node_id)
                    .and_then(|def| def.config.as_ref().map(|c| c.form.clone()))
            })
            .unwrap_or_default();

        self.publish(
            Event::new(EventKind::NodeWaitingHuman, node_run.flow_run_id)
                .for_node(node_run.id, node_run.node_id.clone())
                .with_data(object(&[
                    ("node_name", json!(node_run.node_name)),
                    ("form", serde_json::to_value(&form).unwrap_or(JsonValue::Null)),
                    ("input_type", json!("human_input")),
                ])),
        );

        self.record_timeline(
            flow.task_id,
            node_run.flow_run_id,
            Some(node_run.id),
            "waiting_input",
            json!({
                "node_id": node_run.node_id,
                "node_name": node_run.node_name,
                "message": format!("Waiting for input: {}", node_run.node_name),
            }),
        )
        .await;

        Ok(())
    }
}
