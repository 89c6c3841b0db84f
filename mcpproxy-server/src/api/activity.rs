//! Activity log endpoints

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use mcpproxy_storage::{ActivityFilter, ActivityStatus, ActivityType, ExportFormat};
use mcpproxy_web::{ApiResponse, WebError};

use crate::services::ServiceContainer;

#[derive(Deserialize)]
pub struct ActivityQuery {
    #[serde(rename = "type", default)]
    pub record_type: Option<String>,

    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub since: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default)]
    pub until: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default)]
    pub flow_type: Option<String>,

    #[serde(default)]
    pub risk_level: Option<String>,

    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default)]
    pub offset: usize,

    /// Export format, only used by /activity/export
    #[serde(default)]
    pub format: Option<String>,
}

fn default_limit() -> usize {
    100
}

impl ActivityQuery {
    fn to_filter(&self) -> Result<ActivityFilter, WebError> {
        let record_type = self
            .record_type
            .as_deref()
            .map(ActivityType::from_str)
            .transpose()
            .map_err(WebError::BadRequest)?;
        let status = self
            .status
            .as_deref()
            .map(ActivityStatus::from_str)
            .transpose()
            .map_err(WebError::BadRequest)?;

        Ok(ActivityFilter {
            record_type,
            server: self.server.clone(),
            status,
            session_id: self.session_id.clone(),
            since: self.since,
            until: self.until,
            flow_type: self.flow_type.clone(),
            risk_level: self.risk_level.clone(),
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// GET /api/v1/activity
pub async fn list(
    State(services): State<Arc<ServiceContainer>>,
    Query(query): Query<ActivityQuery>,
) -> Result<ApiResponse<Value>, WebError> {
    let records = services
        .activity
        .query(&query.to_filter()?)
        .map_err(|e| WebError::Internal(e.to_string()))?;
    Ok(ApiResponse::new(json!({ "activity": records })))
}

/// GET /api/v1/activity/summary
pub async fn summary(
    State(services): State<Arc<ServiceContainer>>,
    Query(query): Query<ActivityQuery>,
) -> Result<ApiResponse<Value>, WebError> {
    let summary = services
        .activity
        .summary(&query.to_filter()?)
        .map_err(|e| WebError::Internal(e.to_string()))?;
    Ok(ApiResponse::new(json!({ "summary": summary })))
}

/// GET /api/v1/activity/export?format=json|csv
pub async fn export(
    State(services): State<Arc<ServiceContainer>>,
    Query(query): Query<ActivityQuery>,
) -> Result<impl IntoResponse, WebError> {
    let format = query
        .format
        .as_deref()
        .unwrap_or("json")
        .parse::<ExportFormat>()
        .map_err(WebError::BadRequest)?;

    let body = services
        .activity
        .export(&query.to_filter()?, format)
        .map_err(|e| WebError::Internal(e.to_string()))?;

    let (content_type, filename) = match format {
        ExportFormat::Json => ("application/json", "activity.json"),
        ExportFormat::Csv => ("text/csv", "activity.csv"),
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    ))
}
