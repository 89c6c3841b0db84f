//! API response envelope

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Standard `{success, data}` response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// Successful response with data
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let value = serde_json::to_value(ApiResponse::new(serde_json::json!({"n": 1}))).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["n"], 1);
    }
}
