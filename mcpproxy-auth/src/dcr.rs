//! Dynamic client registration (RFC 7591)
//!
//! Used when an upstream's OAuth config carries no client credentials: the
//! proxy registers itself with the authorization server and persists the
//! issued client ID.

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Client registration request (RFC 7591 §2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Redirect URIs for the authorization-code flow
    pub redirect_uris: Vec<String>,

    /// Human-readable client name
    pub client_name: String,

    /// Grant types the client will use
    pub grant_types: Vec<String>,

    /// Response types the client will use
    pub response_types: Vec<String>,

    /// Token endpoint auth method; `none` for a public PKCE client
    pub token_endpoint_auth_method: String,

    /// Space-separated scope string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl RegistrationRequest {
    /// Registration payload for the proxy's public loopback client
    pub fn public_client(redirect_uri: &str, scopes: &[String]) -> Self {
        Self {
            redirect_uris: vec![redirect_uri.to_string()],
            client_name: "mcpproxy".to_string(),
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            scope: if scopes.is_empty() {
                None
            } else {
                Some(scopes.join(" "))
            },
        }
    }
}

/// Client registration response (RFC 7591 §3.2.1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    /// Issued client identifier
    pub client_id: String,

    /// Issued client secret (absent for public clients)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Registration access token for later updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_access_token: Option<String>,

    /// URI for managing this registration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_client_uri: Option<String>,
}

/// Register a client at the given registration endpoint
pub async fn register(
    http: &reqwest::Client,
    registration_endpoint: &str,
    request: &RegistrationRequest,
) -> AuthResult<RegistrationResponse> {
    let response = http
        .post(registration_endpoint)
        .json(request)
        .send()
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;

    let status = response.status();
    if status != reqwest::StatusCode::CREATED && !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Registration(format!(
            "registration endpoint returned HTTP {}: {}",
            status, body
        )));
    }

    response
        .json::<RegistrationResponse>()
        .await
        .map_err(|e| AuthError::Registration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_client_request_shape() {
        let request =
            RegistrationRequest::public_client("http://127.0.0.1:43123/callback", &[]);
        assert_eq!(request.token_endpoint_auth_method, "none");
        assert_eq!(request.response_types, vec!["code"]);
        assert!(request.scope.is_none());
        assert!(request
            .grant_types
            .contains(&"refresh_token".to_string()));
    }

    #[test]
    fn test_registration_response_deserializes_without_secret() {
        let response: RegistrationResponse =
            serde_json::from_str(r#"{"client_id":"abc123"}"#).unwrap();
        assert_eq!(response.client_id, "abc123");
        assert!(response.client_secret.is_none());
    }
}
