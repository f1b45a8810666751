//! HTTP control API over the engine.
//!
//! JSON command endpoints plus a server-sent-events stream fed by the
//! in-process event bus. The RPC surface is thin: every operation maps
//! onto one engine method.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flowforge_core::{FlowRunId, NodeRunId};
use flowforge_engine::{EngineError, EventBus, FlowExecutor, WILDCARD_CHANNEL};
use flowforge_store::{PgStore, StoreError};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct AppState {
    /// The engine.
    pub engine: Arc<FlowExecutor<PgStore>>,
    /// The live event bus.
    pub bus: Arc<EventBus>,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/flow-runs/{id}/start", post(start_flow))
        .route("/api/flow-runs/{id}/cancel", post(cancel_flow))
        .route("/api/node-runs/{id}/approve", post(approve_node))
        .route("/api/node-runs/{id}/reject", post(reject_node))
        .route("/api/node-runs/{id}/edit", post(edit_node))
        .route("/api/node-runs/{id}/input", post(submit_input))
        .route("/api/node-runs/{id}/retry", post(retry_node))
        .route("/api/test-agent", post(test_agent))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

/// API error with an appropriate status code per error kind.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            EngineError::Dsl(_) | EngineError::InvalidHumanInput { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::InvalidNodeState { .. } | EngineError::FlowNotCancellable { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

fn bad_id(what: &str) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, format!("invalid {what}"))
}

fn parse_flow_id(raw: &str) -> Result<FlowRunId, ApiError> {
    raw.parse().map_err(|_| bad_id("flow run id"))
}

fn parse_node_id(raw: &str) -> Result<NodeRunId, ApiError> {
    raw.parse().map_err(|_| bad_id("node run id"))
}

#[derive(Deserialize)]
struct StartFlowBody {
    dsl: String,
    #[serde(default)]
    params: HashMap<String, String>,
}

async fn start_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StartFlowBody>,
) -> Result<Json<JsonValue>, ApiError> {
    let flow_run_id = parse_flow_id(&id)?;
    state
        .engine
        .start_flow(flow_run_id, &body.dsl, body.params)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn cancel_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let flow_run_id = parse_flow_id(&id)?;
    state.engine.cancel_flow(flow_run_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn approve_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let node_run_id = parse_node_id(&id)?;
    state.engine.approve(node_run_id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct RejectBody {
    #[serde(default)]
    feedback: String,
}

async fn reject_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<JsonValue>, ApiError> {
    let node_run_id = parse_node_id(&id)?;
    state.engine.reject(node_run_id, &body.feedback).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct EditBody {
    edited_content: String,
    #[serde(default)]
    change_summary: String,
}

async fn edit_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EditBody>,
) -> Result<Json<JsonValue>, ApiError> {
    let node_run_id = parse_node_id(&id)?;
    state
        .engine
        .edit(node_run_id, &body.edited_content, &body.change_summary)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct SubmitInputBody {
    data: JsonValue,
}

async fn submit_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitInputBody>,
) -> Result<Json<JsonValue>, ApiError> {
    let node_run_id = parse_node_id(&id)?;
    state
        .engine
        .submit_human_input(node_run_id, &body.data.to_string())
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn retry_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let node_run_id = parse_node_id(&id)?;
    state.engine.retry(node_run_id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct TestAgentBody {
    role: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    prompt: String,
}

async fn test_agent(
    State(state): State<AppState>,
    Json(body): Json<TestAgentBody>,
) -> Result<Json<JsonValue>, ApiError> {
    let response = state
        .engine
        .test_agent(&body.role, &body.mode, &body.prompt)
        .await?;
    Ok(Json(serde_json::to_value(&response).unwrap_or(JsonValue::Null)))
}

#[derive(Deserialize)]
struct EventStreamQuery {
    #[serde(default)]
    flow_run_id: Option<String>,
}

/// Server-streaming endpoint. An absent `flow_run_id` subscribes to the
/// wildcard channel.
async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let channel = match query.flow_run_id.as_deref() {
        Some(raw) if !raw.is_empty() => {
            let flow_run_id = parse_flow_id(raw)?;
            flowforge_engine::bus::flow_channel(flow_run_id)
        }
        _ => WILDCARD_CHANNEL.to_string(),
    };

    let subscription = state.bus.subscribe(channel);
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = SseEvent::default()
            .event(event.kind.as_str())
            .json_data(&event)
            .ok()?;
        Some((Ok::<_, Infallible>(sse), subscription))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
