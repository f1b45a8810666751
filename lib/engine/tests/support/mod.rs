//! Test support: an in-memory store implementation and a scriptable
//! adapter, so engine behavior is exercised without Postgres or Docker.

use async_trait::async_trait;
use flowforge_agent::{
    Adapter, AdapterRegistry, AgentError, AgentRequest, AgentResponse, ExecuteOptions,
};
use flowforge_core::{ArtifactId, FlowRunId, NodeRunId, TaskId};
use flowforge_engine::{EventBus, FlowExecutor};
use flowforge_store::{
    AgentRoleConfig, FlowRunRecord, FlowStatus, NodeRunRecord, NodeStatus, Store, StoreError,
    TaskGitInfo, TimelineEventRecord,
};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory [`Store`] with the same latest-attempt and atomic-claim
/// semantics as the Postgres implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    flow_runs: HashMap<FlowRunId, FlowRunRecord>,
    node_runs: Vec<NodeRunRecord>,
    timeline: Vec<TimelineEventRecord>,
    tasks: HashMap<TaskId, TaskGitInfo>,
    roles: HashMap<String, AgentRoleConfig>,
    artifacts: Vec<(ArtifactId, String, String)>,
    artifact_versions: Vec<(ArtifactId, i32, String)>,
}

impl Inner {
    /// Index of the latest attempt per node id, in stable row order.
    fn latest_rows(&self, flow_run_id: FlowRunId) -> HashMap<String, usize> {
        let mut latest: HashMap<String, usize> = HashMap::new();
        for (idx, run) in self.node_runs.iter().enumerate() {
            if run.flow_run_id != flow_run_id {
                continue;
            }
            match latest.get(&run.node_id) {
                Some(&existing) if self.node_runs[existing].attempt >= run.attempt => {}
                _ => {
                    latest.insert(run.node_id.clone(), idx);
                }
            }
        }
        latest
    }

    fn node_run_mut(&mut self, id: NodeRunId) -> Result<&mut NodeRunRecord, StoreError> {
        self.node_runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StoreError::not_found("node run", id.to_string()))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_flow_run(&self, record: FlowRunRecord) {
        self.inner
            .lock()
            .unwrap()
            .flow_runs
            .insert(record.id, record);
    }

    pub fn insert_task(&self, task_id: TaskId, info: TaskGitInfo) {
        self.inner.lock().unwrap().tasks.insert(task_id, info);
    }

    pub fn insert_role(&self, config: AgentRoleConfig) {
        self.inner
            .lock()
            .unwrap()
            .roles
            .insert(config.slug.clone(), config);
    }

    /// Snapshot of every node run row, in creation order.
    pub fn node_runs(&self) -> Vec<NodeRunRecord> {
        self.inner.lock().unwrap().node_runs.clone()
    }

    /// Snapshot of the timeline.
    pub fn timeline_events(&self) -> Vec<TimelineEventRecord> {
        self.inner.lock().unwrap().timeline.clone()
    }

    /// Directly mutates a node run row (test-only, e.g. simulating a
    /// dead worker).
    pub fn mutate_node_run(&self, id: NodeRunId, f: impl FnOnce(&mut NodeRunRecord)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.node_runs.iter_mut().find(|run| run.id == id) {
            f(run);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn flow_run(&self, id: FlowRunId) -> Result<FlowRunRecord, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .flow_runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("flow run", id.to_string()))
    }

    async fn update_flow_run_status(
        &self,
        id: FlowRunId,
        status: FlowStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flow_runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("flow run", id.to_string()))?;
        flow.status = status;
        let now = chrono::Utc::now();
        if status == FlowStatus::Running && flow.started_at.is_none() {
            flow.started_at = Some(now);
        }
        if status.is_terminal() && flow.completed_at.is_none() {
            flow.completed_at = Some(now);
        }
        Ok(())
    }

    async fn update_flow_run_error(
        &self,
        id: FlowRunId,
        status: FlowStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flow_runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("flow run", id.to_string()))?;
        flow.status = status;
        flow.error = Some(error.to_string());
        flow.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn save_dsl_snapshot(
        &self,
        id: FlowRunId,
        dsl: &str,
        variables: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flow_runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("flow run", id.to_string()))?;
        flow.dsl_snapshot = Some(dsl.to_string());
        flow.variables = Some(serde_json::to_value(variables).expect("encode variables"));
        Ok(())
    }

    async fn update_flow_run_pr(
        &self,
        id: FlowRunId,
        branch_name: &str,
        pr_url: &str,
        pr_number: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flow_runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("flow run", id.to_string()))?;
        if !branch_name.is_empty() {
            flow.branch_name = Some(branch_name.to_string());
        }
        if !pr_url.is_empty() {
            flow.pr_url = Some(pr_url.to_string());
        }
        if pr_number.is_some() {
            flow.pr_number = pr_number;
        }
        Ok(())
    }

    async fn create_node_run(&self, record: &NodeRunRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().node_runs.push(record.clone());
        Ok(())
    }

    async fn acquire_next_node_run(
        &self,
        worker_id: &str,
    ) -> Result<Option<NodeRunRecord>, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let mut queued: Vec<usize> = inner
            .node_runs
            .iter()
            .enumerate()
            .filter(|(_, run)| run.status == NodeStatus::Queued)
            .map(|(idx, _)| idx)
            .collect();
        queued.sort_by_key(|&idx| inner.node_runs[idx].created_at);

        let Some(&idx) = queued.first() else {
            return Ok(None);
        };

        let now = chrono::Utc::now();
        let run = &mut inner.node_runs[idx];
        run.status = NodeStatus::Running;
        run.locked_by = Some(worker_id.to_string());
        run.locked_at = Some(now);
        run.started_at = Some(now);
        Ok(Some(run.clone()))
    }

    async fn reset_stale_running_nodes(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for run in &mut inner.node_runs {
            if run.status == NodeStatus::Running && run.locked_by.is_some() {
                run.status = NodeStatus::Queued;
                run.locked_by = None;
                run.locked_at = None;
                run.started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn node_run(&self, id: NodeRunId) -> Result<NodeRunRecord, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .node_runs
            .iter()
            .find(|run| run.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node run", id.to_string()))
    }

    async fn latest_node_run(
        &self,
        flow_run_id: FlowRunId,
        node_id: &str,
    ) -> Result<Option<NodeRunRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .node_runs
            .iter()
            .filter(|run| run.flow_run_id == flow_run_id && run.node_id == node_id)
            .max_by_key(|run| run.attempt)
            .cloned())
    }

    async fn update_node_run_status(
        &self,
        id: NodeRunId,
        status: NodeStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.node_run_mut(id)?;
        run.status = status;
        if status.is_terminal() && run.completed_at.is_none() {
            run.completed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn update_node_run_input(
        &self,
        id: NodeRunId,
        input: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.node_run_mut(id)?.input = Some(input.clone());
        Ok(())
    }

    async fn update_node_run_output(
        &self,
        id: NodeRunId,
        output: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.node_run_mut(id)?.output = Some(output.clone());
        Ok(())
    }

    async fn update_node_run_error(
        &self,
        id: NodeRunId,
        status: NodeStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.node_run_mut(id)?;
        run.status = status;
        run.error = Some(error.to_string());
        run.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn update_node_run_review(
        &self,
        id: NodeRunId,
        action: &str,
        comment: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.node_run_mut(id)?;
        run.review_action = Some(action.to_string());
        run.review_comment = Some(comment.to_string());
        run.reviewed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn update_node_run_log_stream(
        &self,
        id: NodeRunId,
        events: &[JsonValue],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.node_run_mut(id)?.log_stream = Some(JsonValue::Array(events.to_vec()));
        Ok(())
    }

    async fn completed_node_ids(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .latest_rows(flow_run_id)
            .into_iter()
            .filter(|(_, idx)| inner.node_runs[*idx].status == NodeStatus::Completed)
            .map(|(node_id, _)| node_id)
            .collect())
    }

    async fn pending_node_runs(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<Vec<NodeRunRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<NodeRunRecord> = inner
            .latest_rows(flow_run_id)
            .into_values()
            .map(|idx| inner.node_runs[idx].clone())
            .filter(|run| run.status == NodeStatus::Pending)
            .collect();
        rows.sort_by_key(|run| run.created_at);
        Ok(rows)
    }

    async fn all_nodes_completed(&self, flow_run_id: FlowRunId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .latest_rows(flow_run_id)
            .into_values()
            .all(|idx| inner.node_runs[idx].status == NodeStatus::Completed))
    }

    async fn all_node_run_outputs(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<HashMap<String, JsonValue>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut outputs = HashMap::new();
        for (node_id, idx) in inner.latest_rows(flow_run_id) {
            let run = &inner.node_runs[idx];
            if run.status == NodeStatus::Completed {
                if let Some(output) = &run.output {
                    outputs.insert(node_id, output.clone());
                }
            }
        }
        Ok(outputs)
    }

    async fn cancel_pending_node_runs(&self, flow_run_id: FlowRunId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = chrono::Utc::now();
        for run in &mut inner.node_runs {
            if run.flow_run_id == flow_run_id
                && matches!(run.status, NodeStatus::Pending | NodeStatus::Queued)
            {
                run.status = NodeStatus::Cancelled;
                run.completed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn task_git_info(&self, task_id: TaskId) -> Result<TaskGitInfo, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_id.to_string()))
    }

    async fn update_task_git_branch(
        &self,
        task_id: TaskId,
        branch: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.tasks.get_mut(&task_id) {
            info.base_branch = branch.to_string();
        }
        Ok(())
    }

    async fn create_timeline_event(&self, record: &TimelineEventRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().timeline.push(record.clone());
        Ok(())
    }

    async fn create_artifact(
        &self,
        _task_id: TaskId,
        artifact_type: &str,
        title: &str,
        _file_path: &str,
    ) -> Result<ArtifactId, StoreError> {
        let id = ArtifactId::new();
        self.inner.lock().unwrap().artifacts.push((
            id,
            artifact_type.to_string(),
            title.to_string(),
        ));
        Ok(id)
    }

    async fn create_artifact_version(
        &self,
        artifact_id: ArtifactId,
        version: i32,
        content: &str,
        _change_summary: &str,
        _created_by: &str,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().artifact_versions.push((
            artifact_id,
            version,
            content.to_string(),
        ));
        Ok(())
    }

    async fn agent_role_config(
        &self,
        slug: &str,
    ) -> Result<Option<AgentRoleConfig>, StoreError> {
        Ok(self.inner.lock().unwrap().roles.get(slug).cloned())
    }
}

/// Adapter returning a scripted output per node id, optionally failing
/// a node once or stalling to exercise cancellation.
pub struct ScriptedAdapter {
    outputs: Mutex<HashMap<String, Map<String, JsonValue>>>,
    fail_once: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            fail_once: Mutex::new(HashSet::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(self, node_id: &str, output: JsonValue) -> Self {
        let map = output.as_object().cloned().expect("scripted output object");
        self.outputs
            .lock()
            .unwrap()
            .insert(node_id.to_string(), map);
        self
    }

    pub fn failing_once(self, node_id: &str) -> Self {
        self.fail_once.lock().unwrap().insert(node_id.to_string());
        self
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        req: &AgentRequest,
        opts: &ExecuteOptions,
    ) -> Result<AgentResponse, AgentError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = opts.cancel.cancelled() => return Err(AgentError::Cancelled),
            }
        }

        if self.fail_once.lock().unwrap().remove(&req.node_id) {
            return Err(AgentError::ExecutionFailed {
                exit_code: 1,
                stderr: format!("scripted failure for {}", req.node_id),
            });
        }

        let output = self
            .outputs
            .lock()
            .unwrap()
            .get(&req.node_id)
            .cloned()
            .unwrap_or_default();

        Ok(AgentResponse {
            output,
            metrics: None,
            git_metadata: None,
        })
    }
}

/// A flow run wired to a fresh engine, in-memory store, and bus.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<EventBus>,
    pub engine: Arc<FlowExecutor<MemoryStore>>,
    pub flow_run_id: FlowRunId,
    pub task_id: TaskId,
}

impl Harness {
    /// Builds a harness with the scripted adapter mapped to the default
    /// role, and a pending flow run ready for `start_flow`.
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());

        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        registry.map_role("general-developer", "scripted", None);

        let engine = Arc::new(FlowExecutor::new(
            store.clone(),
            bus.clone(),
            Arc::new(registry),
        ));

        let task_id = TaskId::new();
        store.insert_task(
            task_id,
            TaskGitInfo {
                repo_url: String::new(),
                base_branch: "main".to_string(),
                access_token: String::new(),
                title: "Test task".to_string(),
            },
        );

        let flow = FlowRunRecord::new(task_id, flowforge_core::WorkflowId::new());
        let flow_run_id = flow.id;
        store.insert_flow_run(flow);

        Self {
            store,
            bus,
            engine,
            flow_run_id,
            task_id,
        }
    }

    /// The latest attempt row for a node id.
    pub async fn latest(&self, node_id: &str) -> NodeRunRecord {
        self.store
            .latest_node_run(self.flow_run_id, node_id)
            .await
            .expect("store")
            .unwrap_or_else(|| panic!("no node run for {node_id}"))
    }

    /// Current flow run record.
    pub async fn flow(&self) -> FlowRunRecord {
        self.store.flow_run(self.flow_run_id).await.expect("flow run")
    }
}
