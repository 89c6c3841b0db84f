//! Web error types and their HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Web result type
pub type WebResult<T> = Result<T, WebError>;

/// Errors surfaced through the HTTP API
///
/// Internal detail stays in the logs; clients get a stable code and a
/// one-line message in the `{success, error}` envelope.
#[derive(Error, Debug)]
pub enum WebError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Blocked by policy: {0}")]
    PolicyBlocked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WebError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            WebError::Unauthorized(_) => "unauthorized",
            WebError::RateLimited => "rate_limited",
            WebError::BadRequest(_) => "bad_request",
            WebError::NotFound(_) => "not_found",
            WebError::Conflict(_) => "conflict",
            WebError::PolicyBlocked(_) => "policy_blocked",
            WebError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            WebError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WebError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            WebError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebError::NotFound(_) => StatusCode::NOT_FOUND,
            WebError::Conflict(_) => StatusCode::CONFLICT,
            WebError::PolicyBlocked(_) => StatusCode::FORBIDDEN,
            WebError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(WebError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(WebError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(WebError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(WebError::PolicyBlocked("x".into()).status(), StatusCode::FORBIDDEN);
    }
}
