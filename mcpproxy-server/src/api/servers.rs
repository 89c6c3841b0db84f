//! Server management endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use mcpproxy_config::ServerConfig;
use mcpproxy_storage::{ActivityRecord, ActivityStatus, ActivityType};
use mcpproxy_web::{ApiResponse, WebError};

use crate::builtins;
use crate::services::ServiceContainer;

type ApiResult = Result<ApiResponse<Value>, WebError>;

/// GET /api/v1/servers
pub async fn list(State(services): State<Arc<ServiceContainer>>) -> ApiResult {
    let mut servers = Vec::new();
    for status in services.manager.all().await {
        let auth_state = match services.oauth.stored_tokens(&status.name) {
            Ok(Some(tokens)) => {
                if tokens.is_expired(chrono::Utc::now()) {
                    "expired"
                } else {
                    "authenticated"
                }
            }
            _ => "none",
        };
        let mut value = serde_json::to_value(&status)
            .map_err(|e| WebError::Internal(e.to_string()))?;
        value["auth_state"] = json!(auth_state);
        servers.push(value);
    }
    Ok(ApiResponse::new(json!({ "servers": servers })))
}

/// POST /api/v1/servers
pub async fn add(
    State(services): State<Arc<ServiceContainer>>,
    Json(config): Json<ServerConfig>,
) -> ApiResult {
    mutate(
        &services,
        json!({ "operation": "add", "config": config }),
    )
    .await
}

/// GET /api/v1/servers/{name}
pub async fn detail(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    let statuses = services.manager.all().await;
    let status = statuses
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| WebError::NotFound(format!("server '{}'", name)))?;
    let config = services.manager.get_config(&name).await;
    let refresh_state = services.refresh.state(&name).await;

    Ok(ApiResponse::new(json!({
        "server": status,
        "config": config,
        "refresh": refresh_state,
    })))
}

/// PATCH /api/v1/servers/{name}
pub async fn update(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
    Json(mut config): Json<ServerConfig>,
) -> ApiResult {
    config.name = name;
    mutate(
        &services,
        json!({ "operation": "update", "config": config }),
    )
    .await
}

/// DELETE /api/v1/servers/{name}
pub async fn remove(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    mutate(&services, json!({ "operation": "remove", "name": name })).await
}

/// POST /api/v1/servers/{name}/restart
pub async fn restart(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    mutate(&services, json!({ "operation": "restart", "name": name })).await
}

/// POST /api/v1/servers/{name}/enable
pub async fn enable(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    mutate(&services, json!({ "operation": "enable", "name": name })).await
}

/// POST /api/v1/servers/{name}/disable
pub async fn disable(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    mutate(&services, json!({ "operation": "disable", "name": name })).await
}

#[derive(Deserialize)]
pub struct QuarantineBody {
    pub quarantined: bool,
}

/// POST /api/v1/servers/{name}/quarantine
pub async fn quarantine(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
    Json(body): Json<QuarantineBody>,
) -> ApiResult {
    let operation = if body.quarantined {
        "quarantine"
    } else {
        "unquarantine"
    };
    mutate(&services, json!({ "operation": operation, "name": name })).await
}

/// POST /api/v1/servers/{name}/oauth/login
///
/// Starts the PKCE flow and returns the authorization URL; token exchange
/// completes in the background when the callback arrives.
pub async fn oauth_login(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    let pending = services
        .oauth
        .begin_login(&name, None)
        .await
        .map_err(|e| WebError::BadRequest(e.to_string()))?;

    let auth_url = pending.auth_url.clone();
    let state = pending.state.clone();

    let oauth = services.oauth.clone();
    let refresh = services.refresh.clone();
    let manager = services.manager.clone();
    let events = services.events.clone();
    let server = name.clone();
    tokio::spawn(async move {
        match oauth
            .finish_login(pending, std::time::Duration::from_secs(300))
            .await
        {
            Ok(tokens) => {
                events.publish(
                    mcpproxy_web::events::channels::OAUTH,
                    json!({ "server": server, "event": "authorized" }),
                );
                refresh.enable(tokens).await;
                // Wake the session so it reconnects with credentials
                let _ = manager.restart(&server).await;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "Authorization flow failed");
                events.publish(
                    mcpproxy_web::events::channels::OAUTH,
                    json!({ "server": server, "event": "failed", "error": e.to_string() }),
                );
            }
        }
    });

    Ok(ApiResponse::new(json!({
        "auth_url": auth_url,
        "state": state,
    })))
}

/// POST /api/v1/servers/{name}/oauth/logout
pub async fn oauth_logout(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    let removed = services
        .oauth
        .logout(&name)
        .map_err(|e| WebError::Internal(e.to_string()))?;
    services.refresh.disable(&name).await;

    let record = ActivityRecord::new(ActivityType::ServerChange)
        .with_server(name.clone())
        .with_status(ActivityStatus::Success)
        .with_metadata(json!({ "change": "oauth_logout" }));
    services.activity.record(record);

    Ok(ApiResponse::new(json!({ "removed_token_sets": removed })))
}

/// GET /api/v1/servers/{name}/tools
pub async fn tools(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
) -> ApiResult {
    let session = services
        .manager
        .get(&name)
        .await
        .ok_or_else(|| WebError::NotFound(format!("server '{}'", name)))?;
    let tools = session.tools().await;
    Ok(ApiResponse::new(json!({ "tools": tools })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    100
}

/// GET /api/v1/servers/{name}/logs?tail=N
pub async fn logs(
    State(services): State<Arc<ServiceContainer>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult {
    let lines = services
        .log_rings
        .tail(&name, query.tail)
        .map_err(|e| WebError::Internal(e.to_string()))?;
    Ok(ApiResponse::new(json!({ "lines": lines })))
}

/// Route a mutation through the same path as the `upstream_servers` built-in
async fn mutate(services: &Arc<ServiceContainer>, args: Value) -> ApiResult {
    let result = builtins::dispatch(services, "api", builtins::UPSTREAM_SERVERS, args).await;
    if result.is_error {
        return Err(WebError::BadRequest(result.text_content()));
    }
    let data: Value =
        serde_json::from_str(&result.text_content()).unwrap_or_else(|_| json!({}));
    Ok(ApiResponse::new(data))
}
