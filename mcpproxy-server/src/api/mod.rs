//! REST API router
//!
//! All endpoints answer with the `{success, data}` / `{success, error}`
//! envelope. The same router serves both listeners; middleware reads the
//! connection-source tag to decide authentication and rate limiting.

pub mod activity;
pub mod config_api;
pub mod servers;
pub mod tools;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use std::sync::Arc;

use mcpproxy_web::{
    api_key_middleware, rate_limit_middleware, request_id_middleware, ApiResponse,
};

use crate::hooks::HookRequest;
use crate::mcp_endpoint;
use crate::registry;
use crate::services::ServiceContainer;

/// Build the complete handler tree served by both listeners
pub fn build_router(services: Arc<ServiceContainer>) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/servers", get(servers::list).post(servers::add))
        .route(
            "/servers/{name}",
            get(servers::detail)
                .patch(servers::update)
                .delete(servers::remove),
        )
        .route("/servers/{name}/restart", post(servers::restart))
        .route("/servers/{name}/enable", post(servers::enable))
        .route("/servers/{name}/disable", post(servers::disable))
        .route("/servers/{name}/oauth/login", post(servers::oauth_login))
        .route("/servers/{name}/oauth/logout", post(servers::oauth_logout))
        .route("/servers/{name}/quarantine", post(servers::quarantine))
        .route("/servers/{name}/tools", get(servers::tools))
        .route("/servers/{name}/logs", get(servers::logs))
        .route("/tools/search", get(tools::search))
        .route("/tool-calls", get(tools::tool_calls))
        .route("/tool-calls/{id}/replay", post(tools::replay))
        .route("/activity", get(activity::list))
        .route("/activity/summary", get(activity::summary))
        .route("/activity/export", get(activity::export))
        .route(
            "/config",
            get(config_api::get_config),
        )
        .route("/config/validate", post(config_api::validate))
        .route("/config/apply", post(config_api::apply))
        .route("/hooks/evaluate", post(hooks_evaluate))
        .route("/registries", get(registries))
        .route("/registries/servers/search", get(registries_search));

    Router::new()
        .nest("/api/v1", api)
        .route("/mcp", post(mcp_endpoint::handle))
        .route("/events", get(events))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            services.api_key.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            services.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(services)
}

/// GET /api/v1/status
async fn status(State(services): State<Arc<ServiceContainer>>) -> impl IntoResponse {
    let config = services.config.read();
    ApiResponse::new(json!({
        "running": true,
        "version": env!("CARGO_PKG_VERSION"),
        "listen": config.listen,
        "coverage_mode": services.coverage_mode().as_str(),
        "hooks_active": services
            .hooks_active
            .load(std::sync::atomic::Ordering::SeqCst),
        "config_epoch": services.current_epoch(),
    }))
}

/// POST /api/v1/hooks/evaluate
async fn hooks_evaluate(
    State(services): State<Arc<ServiceContainer>>,
    Json(request): Json<HookRequest>,
) -> impl IntoResponse {
    let response = services.hooks.evaluate(&services, &request).await;
    Json(response)
}

/// GET /api/v1/registries
async fn registries() -> impl IntoResponse {
    ApiResponse::new(json!({ "registries": registry::known_registries() }))
}

#[derive(serde::Deserialize)]
struct RegistrySearchQuery {
    registry: String,
    #[serde(default)]
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    10
}

/// GET /api/v1/registries/servers/search
async fn registries_search(
    State(services): State<Arc<ServiceContainer>>,
    axum::extract::Query(query): axum::extract::Query<RegistrySearchQuery>,
) -> Result<ApiResponse<serde_json::Value>, mcpproxy_web::WebError> {
    if !services.config.read().check_server_repo {
        return Err(mcpproxy_web::WebError::BadRequest(
            "registry search is disabled".into(),
        ));
    }
    let servers = registry::search_servers(&query.registry, &query.q, query.limit)
        .await
        .map_err(mcpproxy_web::WebError::BadRequest)?;
    Ok(ApiResponse::new(json!({ "servers": servers })))
}

/// GET /events (SSE)
async fn events(State(services): State<Arc<ServiceContainer>>) -> impl IntoResponse {
    services.events.sse_stream()
}
