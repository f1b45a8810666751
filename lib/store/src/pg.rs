//! Postgres implementation of the [`Store`] contract.
//!
//! Queries follow the repository style used across the workspace:
//! `query_as` into explicit row structs, typed IDs bound as strings,
//! latest-attempt views expressed with `DISTINCT ON`.

use crate::error::StoreError;
use crate::git_url::inject_token_into_url;
use crate::models::{
    AgentRoleConfig, FlowRunRecord, FlowStatus, NodeRunRecord, NodeStatus, TaskGitInfo,
    TimelineEventRecord,
};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{ArtifactId, FlowRunId, NodeRunId, TaskId, WorkflowId};
use ulid::Ulid;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_id<T: FromStr>(raw: &str, what: &'static str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::decode(format!("invalid {what} '{raw}': {e}")))
}

// ─── Flow runs ───

#[derive(FromRow)]
struct FlowRunRow {
    id: String,
    task_id: String,
    workflow_id: String,
    status: String,
    error: Option<String>,
    dsl_snapshot: Option<String>,
    variables: Option<JsonValue>,
    branch_name: Option<String>,
    pr_url: Option<String>,
    pr_number: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl FlowRunRow {
    fn try_into_record(self) -> Result<FlowRunRecord, StoreError> {
        Ok(FlowRunRecord {
            id: parse_id::<FlowRunId>(&self.id, "flow run id")?,
            task_id: parse_id::<TaskId>(&self.task_id, "task id")?,
            workflow_id: parse_id::<WorkflowId>(&self.workflow_id, "workflow id")?,
            status: FlowStatus::from_str_value(&self.status),
            error: self.error,
            dsl_snapshot: self.dsl_snapshot,
            variables: self.variables,
            branch_name: self.branch_name,
            pr_url: self.pr_url,
            pr_number: self.pr_number,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
        })
    }
}

const FLOW_RUN_COLUMNS: &str = "id, task_id, workflow_id, status, error, dsl_snapshot, variables, \
     branch_name, pr_url, pr_number, started_at, completed_at, created_at";

// ─── Node runs ───

#[derive(FromRow)]
struct NodeRunRow {
    id: String,
    flow_run_id: String,
    node_id: String,
    node_type: String,
    node_name: String,
    status: String,
    attempt: i32,
    input: Option<JsonValue>,
    output: Option<JsonValue>,
    error: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    review_action: Option<String>,
    review_comment: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    log_stream: Option<JsonValue>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl NodeRunRow {
    fn try_into_record(self) -> Result<NodeRunRecord, StoreError> {
        let node_kind = self
            .node_type
            .parse()
            .map_err(|e| StoreError::decode(format!("node run '{}': {e}", self.id)))?;

        Ok(NodeRunRecord {
            id: parse_id::<NodeRunId>(&self.id, "node run id")?,
            flow_run_id: parse_id::<FlowRunId>(&self.flow_run_id, "flow run id")?,
            node_id: self.node_id,
            node_kind,
            node_name: self.node_name,
            status: NodeStatus::from_str_value(&self.status),
            attempt: self.attempt,
            input: self.input,
            output: self.output,
            error: self.error,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            review_action: self.review_action,
            review_comment: self.review_comment,
            reviewed_at: self.reviewed_at,
            log_stream: self.log_stream,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
        })
    }
}

const NODE_RUN_COLUMNS: &str = "id, flow_run_id, node_id, node_type, node_name, status, attempt, \
     input, output, error, locked_by, locked_at, review_action, review_comment, reviewed_at, \
     log_stream, started_at, completed_at, created_at";

#[async_trait]
impl Store for PgStore {
    async fn flow_run(&self, id: FlowRunId) -> Result<FlowRunRecord, StoreError> {
        let row: Option<FlowRunRow> = sqlx::query_as(&format!(
            "SELECT {FLOW_RUN_COLUMNS} FROM flow_runs WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => r.try_into_record(),
            None => Err(StoreError::not_found("flow run", id.to_string())),
        }
    }

    async fn update_flow_run_status(
        &self,
        id: FlowRunId,
        status: FlowStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let started_at = (status == FlowStatus::Running).then_some(now);
        let completed_at = status.is_terminal().then_some(now);

        sqlx::query(
            r#"
            UPDATE flow_runs
            SET status = $2,
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(started_at)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_flow_run_error(
        &self,
        id: FlowRunId,
        status: FlowStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE flow_runs
            SET status = $2, error = $3, completed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_dsl_snapshot(
        &self,
        id: FlowRunId,
        dsl: &str,
        variables: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let variables = serde_json::to_value(variables)
            .map_err(|e| StoreError::decode(format!("encode variables: {e}")))?;

        sqlx::query(
            r#"
            UPDATE flow_runs
            SET dsl_snapshot = $2, variables = $3
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(dsl)
        .bind(variables)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_flow_run_pr(
        &self,
        id: FlowRunId,
        branch_name: &str,
        pr_url: &str,
        pr_number: Option<i32>,
    ) -> Result<(), StoreError> {
        // NULLIF keeps earlier values when the new one is empty.
        sqlx::query(
            r#"
            UPDATE flow_runs
            SET branch_name = COALESCE(NULLIF($2, ''), branch_name),
                pr_url = COALESCE(NULLIF($3, ''), pr_url),
                pr_number = COALESCE($4, pr_number)
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(branch_name)
        .bind(pr_url)
        .bind(pr_number)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_node_run(&self, record: &NodeRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO node_runs
                (id, flow_run_id, node_id, node_type, node_name, status, attempt, input,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.flow_run_id.to_string())
        .bind(&record.node_id)
        .bind(record.node_kind.as_str())
        .bind(&record.node_name)
        .bind(record.status.as_str())
        .bind(record.attempt)
        .bind(&record.input)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn acquire_next_node_run(
        &self,
        worker_id: &str,
    ) -> Result<Option<NodeRunRecord>, StoreError> {
        let now = Utc::now();
        let row: Option<NodeRunRow> = sqlx::query_as(&format!(
            r#"
            UPDATE node_runs
            SET status = 'running', locked_by = $1, locked_at = $2, started_at = $2
            WHERE id = (
                SELECT id FROM node_runs
                WHERE status = 'queued'
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {NODE_RUN_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRunRow::try_into_record).transpose()
    }

    async fn reset_stale_running_nodes(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE node_runs
            SET status = 'queued', locked_by = NULL, locked_at = NULL, started_at = NULL
            WHERE status = 'running' AND locked_by IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn node_run(&self, id: NodeRunId) -> Result<NodeRunRecord, StoreError> {
        let row: Option<NodeRunRow> = sqlx::query_as(&format!(
            "SELECT {NODE_RUN_COLUMNS} FROM node_runs WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => r.try_into_record(),
            None => Err(StoreError::not_found("node run", id.to_string())),
        }
    }

    async fn latest_node_run(
        &self,
        flow_run_id: FlowRunId,
        node_id: &str,
    ) -> Result<Option<NodeRunRecord>, StoreError> {
        let row: Option<NodeRunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_RUN_COLUMNS} FROM node_runs
            WHERE flow_run_id = $1 AND node_id = $2
            ORDER BY attempt DESC, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(flow_run_id.to_string())
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRunRow::try_into_record).transpose()
    }

    async fn update_node_run_status(
        &self,
        id: NodeRunId,
        status: NodeStatus,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then_some(Utc::now());

        sqlx::query(
            r#"
            UPDATE node_runs
            SET status = $2, completed_at = COALESCE($3, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_node_run_input(
        &self,
        id: NodeRunId,
        input: &JsonValue,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE node_runs SET input = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(input)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_node_run_output(
        &self,
        id: NodeRunId,
        output: &JsonValue,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE node_runs SET output = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(output)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_node_run_error(
        &self,
        id: NodeRunId,
        status: NodeStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE node_runs
            SET status = $2, error = $3, completed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_node_run_review(
        &self,
        id: NodeRunId,
        action: &str,
        comment: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE node_runs
            SET review_action = $2, review_comment = $3, reviewed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(action)
        .bind(comment)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_node_run_log_stream(
        &self,
        id: NodeRunId,
        events: &[JsonValue],
    ) -> Result<(), StoreError> {
        let log = JsonValue::Array(events.to_vec());

        sqlx::query("UPDATE node_runs SET log_stream = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(log)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn completed_node_ids(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT node_id FROM (
                SELECT DISTINCT ON (node_id) node_id, status
                FROM node_runs
                WHERE flow_run_id = $1
                ORDER BY node_id, attempt DESC, created_at DESC
            ) latest
            WHERE status = 'completed'
            "#,
        )
        .bind(flow_run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(node_id,)| node_id).collect())
    }

    async fn pending_node_runs(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<Vec<NodeRunRecord>, StoreError> {
        let rows: Vec<NodeRunRow> = sqlx::query_as(
            r#"
            SELECT nr.id, nr.flow_run_id, nr.node_id, nr.node_type, nr.node_name, nr.status,
                   nr.attempt, nr.input, nr.output, nr.error, nr.locked_by, nr.locked_at,
                   nr.review_action, nr.review_comment, nr.reviewed_at, nr.log_stream,
                   nr.started_at, nr.completed_at, nr.created_at
            FROM node_runs nr
            INNER JOIN (
                SELECT DISTINCT ON (node_id) id
                FROM node_runs
                WHERE flow_run_id = $1
                ORDER BY node_id, attempt DESC, created_at DESC
            ) latest ON nr.id = latest.id
            WHERE nr.flow_run_id = $1 AND nr.status = 'pending'
            ORDER BY nr.created_at ASC
            "#,
        )
        .bind(flow_run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRunRow::try_into_record).collect()
    }

    async fn all_nodes_completed(&self, flow_run_id: FlowRunId) -> Result<bool, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT DISTINCT ON (node_id) status
                FROM node_runs
                WHERE flow_run_id = $1
                ORDER BY node_id, attempt DESC, created_at DESC
            ) latest
            WHERE status != 'completed'
            "#,
        )
        .bind(flow_run_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count == 0)
    }

    async fn all_node_run_outputs(
        &self,
        flow_run_id: FlowRunId,
    ) -> Result<HashMap<String, JsonValue>, StoreError> {
        let rows: Vec<(String, JsonValue)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (node_id) node_id, output
            FROM node_runs
            WHERE flow_run_id = $1 AND status = 'completed' AND output IS NOT NULL
            ORDER BY node_id, attempt DESC, created_at DESC
            "#,
        )
        .bind(flow_run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn cancel_pending_node_runs(&self, flow_run_id: FlowRunId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE node_runs SET status = 'cancelled', completed_at = $2
            WHERE flow_run_id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(flow_run_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn task_git_info(&self, task_id: TaskId) -> Result<TaskGitInfo, StoreError> {
        let row: Option<(Option<String>, Option<String>, Option<String>, String)> =
            sqlx::query_as(
                r#"
                SELECT p.git_repo_url, t.git_branch, p.git_access_token, COALESCE(t.title, '')
                FROM tasks t
                JOIN projects p ON t.project_id = p.id
                WHERE t.id = $1
                "#,
            )
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some((repo_url, base_branch, access_token, title)) = row else {
            return Err(StoreError::not_found("task", task_id.to_string()));
        };

        let access_token = access_token.unwrap_or_default();
        let mut repo_url = repo_url.unwrap_or_default();
        if !access_token.is_empty() && !repo_url.is_empty() {
            repo_url = inject_token_into_url(&repo_url, &access_token);
        }

        Ok(TaskGitInfo {
            repo_url,
            base_branch: base_branch.unwrap_or_default(),
            access_token,
            title,
        })
    }

    async fn update_task_git_branch(
        &self,
        task_id: TaskId,
        branch: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET git_branch = $2 WHERE id = $1")
            .bind(task_id.to_string())
            .bind(branch)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_timeline_event(&self, record: &TimelineEventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO timeline_events
                (id, task_id, flow_run_id, node_run_id, event_type, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.task_id.to_string())
        .bind(record.flow_run_id.map(|id| id.to_string()))
        .bind(record.node_run_id.map(|id| id.to_string()))
        .bind(&record.event_type)
        .bind(&record.content)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_artifact(
        &self,
        task_id: TaskId,
        artifact_type: &str,
        title: &str,
        file_path: &str,
    ) -> Result<ArtifactId, StoreError> {
        let id = ArtifactId::new();

        sqlx::query(
            r#"
            INSERT INTO artifacts (id, task_id, type, title, file_path, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id.to_string())
        .bind(task_id.to_string())
        .bind(artifact_type)
        .bind(title)
        .bind(file_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn create_artifact_version(
        &self,
        artifact_id: ArtifactId,
        version: i32,
        content: &str,
        change_summary: &str,
        created_by: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO artifact_versions
                (id, artifact_id, version, content, change_summary, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Ulid::new().to_string())
        .bind(artifact_id.to_string())
        .bind(version)
        .bind(content)
        .bind(change_summary)
        .bind(created_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn agent_role_config(
        &self,
        slug: &str,
    ) -> Result<Option<AgentRoleConfig>, StoreError> {
        let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT slug, agent_type, default_model, system_prompt
            FROM agent_roles
            WHERE slug = $1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(slug, agent_type, default_model, system_prompt)| AgentRoleConfig {
                slug,
                agent_type,
                default_model,
                system_prompt,
            },
        ))
    }
}
