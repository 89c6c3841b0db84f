//! Tool search and call-history endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use mcpproxy_storage::{ActivityFilter, ActivityType};
use mcpproxy_web::{ApiResponse, WebError};

use crate::services::ServiceContainer;

type ApiResult = Result<ApiResponse<Value>, WebError>;

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// GET /api/v1/tools/search?q=...&limit=k
pub async fn search(
    State(services): State<Arc<ServiceContainer>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult {
    let hits = services
        .index
        .query(&query.q, query.limit)
        .map_err(|e| WebError::Internal(e.to_string()))?;
    Ok(ApiResponse::new(json!({ "tools": hits })))
}

#[derive(Deserialize)]
pub struct ToolCallsQuery {
    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default = "default_calls_limit")]
    pub limit: usize,

    #[serde(default)]
    pub offset: usize,
}

fn default_calls_limit() -> usize {
    50
}

/// GET /api/v1/tool-calls
pub async fn tool_calls(
    State(services): State<Arc<ServiceContainer>>,
    Query(query): Query<ToolCallsQuery>,
) -> ApiResult {
    let filter = ActivityFilter {
        record_type: Some(ActivityType::ToolCall),
        server: query.server,
        session_id: query.session_id,
        limit: query.limit,
        offset: query.offset,
        ..Default::default()
    };
    let calls = services
        .activity
        .query(&filter)
        .map_err(|e| WebError::Internal(e.to_string()))?;
    Ok(ApiResponse::new(json!({ "tool_calls": calls })))
}

#[derive(Deserialize)]
pub struct ReplayBody {
    /// Edited arguments for the replay
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// POST /api/v1/tool-calls/{id}/replay
///
/// Re-executes the recorded call with edited arguments. Goes through the
/// full policy gate again and creates a fresh activity record.
pub async fn replay(
    State(services): State<Arc<ServiceContainer>>,
    Path(id): Path<String>,
    Json(body): Json<ReplayBody>,
) -> ApiResult {
    let record = services
        .activity
        .get(&id)
        .map_err(|_| WebError::NotFound(format!("tool call '{}'", id)))?;

    if record.record_type != ActivityType::ToolCall {
        return Err(WebError::BadRequest(format!(
            "record '{}' is not a tool call",
            id
        )));
    }
    let tool = record
        .tool
        .clone()
        .ok_or_else(|| WebError::BadRequest("record has no tool name".into()))?;

    let session_id = record
        .session_id
        .clone()
        .unwrap_or_else(|| "replay".to_string());

    let result = services
        .router
        .call_tool(&services, &session_id, &tool, body.arguments, None)
        .await
        .map_err(|e| WebError::BadRequest(e.to_string()))?;

    Ok(ApiResponse::new(json!({
        "replayed": id,
        "tool": tool,
        "result": result,
    })))
}
