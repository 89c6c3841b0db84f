//! Authorization discovery
//!
//! Two documents drive everything: RFC 9728 Protected Resource Metadata
//! (found via the `WWW-Authenticate` challenge or the well-known path) names
//! the authorization servers and the canonical resource identifier; RFC 8414
//! Authorization Server Metadata supplies the endpoints.

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// OAuth 2.0 Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Resource identifier (RFC 8707 value for token requests)
    pub resource: String,

    /// Authorization servers protecting this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Scopes the resource understands
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Supported bearer token presentation methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bearer_methods_supported: Vec<String>,
}

/// OAuth 2.0 Authorization Server Metadata (RFC 8414), the subset we consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    /// Issuer identifier
    pub issuer: String,

    /// Authorization endpoint
    pub authorization_endpoint: String,

    /// Token endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// Dynamic registration endpoint (RFC 7591)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Supported scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Supported grant types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types_supported: Vec<String>,

    /// Supported PKCE challenge methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthServerMetadata {
    /// Token endpoint, required for the flows we run
    pub fn require_token_endpoint(&self) -> AuthResult<&str> {
        self.token_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::Discovery("metadata has no token_endpoint".into()))
    }
}

/// Extract `resource_metadata` from a `WWW-Authenticate: Bearer ...` challenge
pub fn parse_resource_metadata_challenge(header: &str) -> Option<String> {
    let rest = header.trim().strip_prefix("Bearer")?.trim();
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("resource_metadata=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// HTTP client for the discovery documents
pub struct DiscoveryClient {
    http: reqwest::Client,
}

impl DiscoveryClient {
    pub fn new() -> AuthResult<Self> {
        // Redirects disabled: discovery URLs come from upstream responses
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| AuthError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> AuthResult<T> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Discovery(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AuthError::Discovery(format!("{}: {}", url, e)))
    }

    /// Fetch protected-resource metadata
    ///
    /// `challenge_url` wins when the 401 named one; otherwise the well-known
    /// location derived from the resource URL is tried. When neither exists
    /// the caller falls back to the server URL as the resource identifier.
    pub async fn protected_resource(
        &self,
        resource_url: &str,
        challenge_url: Option<&str>,
    ) -> AuthResult<ProtectedResourceMetadata> {
        if let Some(url) = challenge_url {
            return self.fetch_json(url).await;
        }

        let parsed = url::Url::parse(resource_url)
            .map_err(|e| AuthError::Discovery(format!("bad resource URL: {}", e)))?;
        let well_known = format!(
            "{}://{}{}/.well-known/oauth-protected-resource",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default(),
            parsed
                .port()
                .map(|p| format!(":{}", p))
                .unwrap_or_default()
        );
        self.fetch_json(&well_known).await
    }

    /// Fetch authorization-server metadata, with OIDC discovery fallback
    pub async fn auth_server(&self, issuer: &str) -> AuthResult<AuthServerMetadata> {
        let issuer = issuer.trim_end_matches('/');
        let rfc8414 = format!("{}/.well-known/oauth-authorization-server", issuer);
        match self.fetch_json::<AuthServerMetadata>(&rfc8414).await {
            Ok(metadata) => Ok(metadata),
            Err(_) => {
                let oidc = format!("{}/.well-known/openid-configuration", issuer);
                self.fetch_json(&oidc).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge_with_resource_metadata() {
        let header = r#"Bearer realm="mcp", resource_metadata="https://api.example.com/.well-known/oauth-protected-resource""#;
        assert_eq!(
            parse_resource_metadata_challenge(header).as_deref(),
            Some("https://api.example.com/.well-known/oauth-protected-resource")
        );
    }

    #[test]
    fn test_parse_challenge_without_resource_metadata() {
        assert_eq!(parse_resource_metadata_challenge(r#"Bearer realm="mcp""#), None);
        assert_eq!(parse_resource_metadata_challenge("Basic xyz"), None);
    }

    #[test]
    fn test_prm_deserializes_minimal_document() {
        let prm: ProtectedResourceMetadata = serde_json::from_str(
            r#"{"resource":"https://api.example.com","authorization_servers":["https://auth.example.com"]}"#,
        )
        .unwrap();
        assert_eq!(prm.authorization_servers.len(), 1);
        assert!(prm.scopes_supported.is_empty());
    }

    #[test]
    fn test_metadata_requires_token_endpoint() {
        let metadata: AuthServerMetadata = serde_json::from_str(
            r#"{"issuer":"https://auth.example.com","authorization_endpoint":"https://auth.example.com/authorize"}"#,
        )
        .unwrap();
        assert!(metadata.require_token_endpoint().is_err());
    }
}
