//! Configuration endpoints

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use mcpproxy_config::ConfigLoader;
use mcpproxy_web::{ApiResponse, WebError};

use crate::reload;
use crate::services::ServiceContainer;

type ApiResult = Result<ApiResponse<Value>, WebError>;

/// GET /api/v1/config
///
/// Returns the running configuration snapshot and its epoch. The API key is
/// redacted; everything else round-trips.
pub async fn get_config(State(services): State<Arc<ServiceContainer>>) -> ApiResult {
    let mut snapshot = serde_json::to_value(&*services.config.read())
        .map_err(|e| WebError::Internal(e.to_string()))?;
    if snapshot.get("api_key").is_some() {
        snapshot["api_key"] = json!("<redacted>");
    }
    Ok(ApiResponse::new(json!({
        "config": snapshot,
        "epoch": services.current_epoch(),
    })))
}

/// POST /api/v1/config/validate
pub async fn validate(Json(body): Json<Value>) -> ApiResult {
    let raw = body.to_string();
    match ConfigLoader::new().validate_json(&raw) {
        Ok(_) => Ok(ApiResponse::new(json!({ "valid": true }))),
        Err(e) => Ok(ApiResponse::new(json!({
            "valid": false,
            "error": e.to_string(),
        }))),
    }
}

/// POST /api/v1/config/apply
///
/// Applies hot-reloadable fields atomically; fields that need a process
/// restart are reported back in `requires_restart`. Either every changed
/// hot field is applied (epoch bumps once) or none is.
pub async fn apply(
    State(services): State<Arc<ServiceContainer>>,
    Json(body): Json<Value>,
) -> ApiResult {
    let raw = body.to_string();
    let incoming = ConfigLoader::new()
        .validate_json(&raw)
        .map_err(|e| WebError::BadRequest(e.to_string()))?;

    let outcome = reload::apply_config(&services, incoming)
        .await
        .map_err(WebError::Internal)?;

    Ok(ApiResponse::new(json!({
        "applied": outcome.applied,
        "requires_restart": outcome.requires_restart,
        "epoch": outcome.epoch,
    })))
}
