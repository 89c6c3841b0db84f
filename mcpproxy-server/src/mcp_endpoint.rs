//! Client-facing MCP endpoint
//!
//! One JSON-RPC-over-HTTP endpoint serving `initialize`, `tools/list`,
//! `tools/call` and `ping` to MCP clients. Tool calls are routed through the
//! policy gate; built-in tools are dispatched locally. The MCP session ID is
//! carried in the `Mcp-Session-Id` header; calls that a hook already
//! announced adopt the hook session so both sides land in one flow ring.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use mcpproxy_mcp::protocol::{
    methods, JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse,
};
use mcpproxy_mcp::{SessionState, Tool};

use crate::builtins;
use crate::services::ServiceContainer;

/// Session header shared with upstream transports
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// POST /mcp handler
pub async fn handle(
    State(services): State<Arc<ServiceContainer>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let id = request.id.clone();
    let response = dispatch(&services, &session_id, request).await;

    let mut headers = HeaderMap::new();
    if let Ok(value) = session_id.parse() {
        headers.insert(SESSION_HEADER, value);
    }
    (
        headers,
        Json(response.unwrap_or_else(|error| JsonRpcResponse::error(error, id))),
    )
}

async fn dispatch(
    services: &Arc<ServiceContainer>,
    session_id: &str,
    request: JsonRpcRequest,
) -> Result<JsonRpcResponse, JsonRpcError> {
    let id = request.id.clone();

    match request.method.as_str() {
        methods::INITIALIZE => Ok(JsonRpcResponse::success(
            json!({
                "protocolVersion": mcpproxy_mcp::MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": {
                    "name": "mcpproxy",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            id,
        )),

        methods::INITIALIZED => Ok(JsonRpcResponse::success(json!({}), id)),

        methods::PING => Ok(JsonRpcResponse::success(json!({}), id)),

        methods::TOOLS_LIST => {
            let tools = list_tools(services).await;
            Ok(JsonRpcResponse::success(json!({ "tools": tools }), id))
        }

        methods::TOOLS_CALL => {
            let params = request.params.unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
                return Err(JsonRpcError::new(
                    JsonRpcErrorCode::InvalidParams,
                    "tools/call requires a tool name",
                ));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

            // Prefer the hook session that announced this call, if any
            let effective_session = services
                .hooks
                .correlate_mcp_call(name.rsplit(':').next().unwrap_or(name), &arguments)
                .unwrap_or_else(|| session_id.to_string());
            services.flow.touch(&effective_session);

            let result = if builtins::is_builtin(name) {
                builtins::dispatch(services, &effective_session, name, arguments).await
            } else {
                match services
                    .router
                    .call_tool(services, &effective_session, name, Some(arguments), None)
                    .await
                {
                    Ok(result) => result,
                    // Policy blocks and routing failures surface as tool
                    // errors, not protocol errors
                    Err(e) => mcpproxy_mcp::ToolCallResult::error(e.to_string()),
                }
            };

            let value = serde_json::to_value(&result).map_err(|e| {
                JsonRpcError::new(JsonRpcErrorCode::InternalError, e.to_string())
            })?;
            Ok(JsonRpcResponse::success(value, id))
        }

        other => Err(JsonRpcError::new(
            JsonRpcErrorCode::MethodNotFound,
            format!("method '{}' is not supported", other),
        )),
    }
}

/// Built-ins plus the namespaced tools of ready, visible upstreams
async fn list_tools(services: &Arc<ServiceContainer>) -> Vec<Tool> {
    let mut tools = builtins::definitions();
    let limit = services.config.read().tools_limit;

    let mut upstream = Vec::new();
    for status in services.manager.all().await {
        if status.quarantined || !status.enabled || status.session.state != SessionState::Ready {
            continue;
        }
        if let Some(session) = services.manager.get(&status.name).await {
            for tool in session.tools().await {
                upstream.push(Tool {
                    name: format!("{}:{}", status.name, tool.name),
                    ..tool
                });
            }
        }
    }
    upstream.sort_by(|a, b| a.name.cmp(&b.name));
    upstream.truncate(limit);
    tools.extend(upstream);
    tools
}
