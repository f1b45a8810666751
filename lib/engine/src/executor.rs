//! The flow executor: worker loop, dispatch, and error handling.
//!
//! A single engine instance hosts one or more worker loops. Each loop
//! claims queued node runs atomically through the store, dispatches by
//! node kind, and advances the DAG after every terminal transition.
//! Multi-worker correctness rests entirely on the store's row-locked
//! claim; no in-process locks are required between workers.

mod actions;
mod agent_task;
mod flow;
mod human;

use crate::bus::{Event, EventBus, EventKind};
use crate::error::EngineError;
use flowforge_agent::AdapterRegistry;
use flowforge_core::{FlowRunId, NodeRunId, TaskId};
use flowforge_store::{FlowStatus, NodeRunRecord, NodeStatus, Store, TimelineEventRecord};
use flowforge_workflow::{Dag, NodeDef, NodeKind, WorkflowDsl};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ulid::Ulid;

/// Pause between polls when the queue is empty.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after a claim error before retrying.
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The engine core: hosts the worker loop, advances the DAG, implements
/// the human-action handlers, and enforces rollback bounds.
pub struct FlowExecutor<S> {
    store: Arc<S>,
    bus: Arc<EventBus>,
    registry: Arc<AdapterRegistry>,
    worker_id: String,
    workers: usize,
    poll_interval: Duration,
    // Cancel handles for in-flight flows, reference-counted per claimed
    // node so parallel nodes of one flow share a token.
    cancels: Mutex<HashMap<FlowRunId, (CancellationToken, usize)>>,
}

impl<S: Store> FlowExecutor<S> {
    /// Creates an executor.
    pub fn new(store: Arc<S>, bus: Arc<EventBus>, registry: Arc<AdapterRegistry>) -> Self {
        let ulid = Ulid::new().to_string().to_lowercase();
        let suffix = &ulid[ulid.len() - 8..];
        Self {
            store,
            bus,
            registry,
            worker_id: format!("worker-{suffix}"),
            workers: 1,
            poll_interval: IDLE_POLL_INTERVAL,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the number of worker loops spawned by [`start`](Self::start).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Overrides the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The worker id rows are locked with.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The event bus this executor publishes to.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Recovers stale state and spawns the worker loops.
    ///
    /// Must run before any peer claims work: the recovery step assumes a
    /// single active engine per database.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), EngineError> {
        let reset = self.store.reset_stale_running_nodes().await?;
        if reset > 0 {
            info!(count = reset, "recovered stale running nodes");
        }

        for _ in 0..self.workers {
            let engine = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                engine.run_worker_loop(shutdown).await;
            });
        }

        Ok(())
    }

    /// Polls the queue until shut down.
    pub async fn run_worker_loop(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "starting worker loop");

        loop {
            if shutdown.is_cancelled() {
                info!(worker_id = %self.worker_id, "worker loop stopped");
                return;
            }

            let pause = match self.tick().await {
                Ok(true) => continue,
                Ok(false) => self.poll_interval,
                Err(e) => {
                    error!(error = %e, "failed to acquire node run");
                    ERROR_RETRY_INTERVAL
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(worker_id = %self.worker_id, "worker loop stopped");
                    return;
                }
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Claims and processes at most one queued node run. Returns whether
    /// a claim was made.
    pub async fn tick(&self) -> Result<bool, EngineError> {
        let Some(node_run) = self.store.acquire_next_node_run(&self.worker_id).await? else {
            return Ok(false);
        };
        self.process_node_run(node_run).await;
        Ok(true)
    }

    /// Runs one claimed node to its next state and advances the DAG.
    async fn process_node_run(&self, node_run: NodeRunRecord) {
        info!(
            node_run_id = %node_run.id,
            node_id = %node_run.node_id,
            node_type = %node_run.node_kind,
            flow_run_id = %node_run.flow_run_id,
            "acquired node run"
        );

        let cancel = self.register_cancel(node_run.flow_run_id);

        self.publish(
            Event::new(EventKind::NodeStarted, node_run.flow_run_id)
                .for_node(node_run.id, node_run.node_id.clone()),
        );

        let result = self.dispatch(&node_run, &cancel).await;

        self.unregister_cancel(node_run.flow_run_id);

        if let Err(e) = &result {
            error!(
                node_run_id = %node_run.id,
                node_id = %node_run.node_id,
                error = %e,
                "node execution failed"
            );
        }

        if self.flow_cancelled(&node_run, &result, &cancel).await {
            // The flow was cancelled out from under the node: park the
            // attempt as cancelled and suppress the failure path and the
            // re-queueing advance.
            if let Err(e) = self
                .store
                .update_node_run_status(node_run.id, NodeStatus::Cancelled)
                .await
            {
                warn!(node_run_id = %node_run.id, error = %e, "failed to cancel in-flight node");
            }
            return;
        }

        if let Err(e) = result {
            self.handle_node_error(&node_run, &e).await;
        }

        if let Err(e) = self.advance_dag(node_run.flow_run_id).await {
            error!(
                flow_run_id = %node_run.flow_run_id,
                error = %e,
                "failed to advance DAG"
            );
        }
    }

    /// Dispatches a claimed node run by its kind.
    async fn dispatch(
        &self,
        node_run: &NodeRunRecord,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        match node_run.node_kind {
            NodeKind::AgentTask => self.execute_agent_task(node_run, cancel).await,
            NodeKind::HumanReview => self.execute_human_review(node_run).await,
            NodeKind::HumanInput => self.execute_human_input(node_run).await,
        }
    }

    /// Determines whether the node's flow was cancelled while it ran.
    async fn flow_cancelled(
        &self,
        node_run: &NodeRunRecord,
        result: &Result<(), EngineError>,
        cancel: &CancellationToken,
    ) -> bool {
        if matches!(result, Err(e) if e.is_cancellation()) || cancel.is_cancelled() {
            return true;
        }
        self.store
            .flow_run(node_run.flow_run_id)
            .await
            .map(|flow| flow.status == FlowStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Transitions a failed node and its flow to `failed`.
    async fn handle_node_error(&self, node_run: &NodeRunRecord, exec_err: &EngineError) {
        let message = exec_err.to_string();

        if let Err(e) = self
            .store
            .update_node_run_error(node_run.id, NodeStatus::Failed, &message)
            .await
        {
            error!(node_run_id = %node_run.id, error = %e, "failed to record node error");
        }

        self.publish(
            Event::new(EventKind::NodeFailed, node_run.flow_run_id)
                .for_node(node_run.id, node_run.node_id.clone())
                .with_data(object(&[("error", JsonValue::String(message.clone()))])),
        );

        if let Err(e) = self
            .store
            .update_flow_run_error(node_run.flow_run_id, FlowStatus::Failed, &message)
            .await
        {
            error!(flow_run_id = %node_run.flow_run_id, error = %e, "failed to record flow error");
        }

        self.publish(
            Event::new(EventKind::FlowFailed, node_run.flow_run_id).with_data(object(&[
                ("error", JsonValue::String(message)),
                ("node_id", JsonValue::String(node_run.node_id.clone())),
            ])),
        );
    }

    // ─── Cancel handles ───

    /// Returns the flow's cancel token, creating it on first use. Each
    /// call pairs with one [`unregister_cancel`](Self::unregister_cancel).
    fn register_cancel(&self, flow_run_id: FlowRunId) -> CancellationToken {
        let mut cancels = self.cancels.lock().expect("cancel table poisoned");
        let entry = cancels
            .entry(flow_run_id)
            .or_insert_with(|| (CancellationToken::new(), 0));
        entry.1 += 1;
        entry.0.clone()
    }

    fn unregister_cancel(&self, flow_run_id: FlowRunId) {
        let mut cancels = self.cancels.lock().expect("cancel table poisoned");
        if let Some(entry) = cancels.get_mut(&flow_run_id) {
            entry.1 -= 1;
            if entry.1 == 0 {
                cancels.remove(&flow_run_id);
            }
        }
    }

    /// Fires the flow's cancel handle, if a node is in flight.
    pub(crate) fn fire_cancel(&self, flow_run_id: FlowRunId) {
        let cancels = self.cancels.lock().expect("cancel table poisoned");
        if let Some((token, _)) = cancels.get(&flow_run_id) {
            token.cancel();
        }
    }

    // ─── Shared helpers ───

    pub(crate) fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Appends a timeline event. Best-effort: failures are logged and
    /// swallowed, never failing the controlling operation.
    pub(crate) async fn record_timeline(
        &self,
        task_id: TaskId,
        flow_run_id: FlowRunId,
        node_run_id: Option<NodeRunId>,
        event_type: &str,
        content: JsonValue,
    ) {
        let mut record = TimelineEventRecord::new(task_id, event_type, content)
            .for_flow_run(flow_run_id);
        if let Some(node_run_id) = node_run_id {
            record = record.for_node_run(node_run_id);
        }

        if let Err(e) = self.store.create_timeline_event(&record).await {
            warn!(event_type, error = %e, "failed to create timeline event");
        }
    }

    /// Loads the flow's snapshot and reparses its workflow + DAG.
    pub(crate) fn parse_snapshot(
        &self,
        flow_run_id: FlowRunId,
        snapshot: Option<&str>,
    ) -> Result<(WorkflowDsl, Dag), EngineError> {
        let dsl = snapshot.ok_or(EngineError::MissingSnapshot { flow_run_id })?;
        Ok(Dag::parse(dsl)?)
    }

    /// Finds a node definition in the DAG.
    pub(crate) fn node_def<'d>(
        &self,
        dag: &'d Dag,
        node_id: &str,
    ) -> Result<&'d NodeDef, EngineError> {
        dag.node(node_id).ok_or_else(|| EngineError::NodeNotInDag {
            node_id: node_id.to_string(),
        })
    }
}

/// Builds a JSON object payload from key/value pairs.
pub(crate) fn object(pairs: &[(&str, JsonValue)]) -> serde_json::Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}
