//! OAuth orchestration per upstream server
//!
//! Ties discovery, registration, the PKCE flow and the token store together
//! behind the operations the rest of the proxy needs: begin a login, answer a
//! 401 challenge, refresh, logout.

use chrono::{Duration as ChronoDuration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, RefreshToken, TokenResponse, TokenUrl};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::dcr::{self, RegistrationRequest};
use crate::discovery::{
    parse_resource_metadata_challenge, AuthServerMetadata, DiscoveryClient,
};
use crate::error::{AuthError, AuthResult};
use crate::flow::{map_token_error, AuthFlowResult, PendingAuthorization};
use mcpproxy_config::ServerConfig;
use mcpproxy_storage::{TokenSet, TokenStore};

/// Access tokens within this window of expiry are refreshed before use
const EXPIRY_SLACK_SECS: i64 = 30;

/// OAuth client shared by the upstream manager and the CLI
pub struct OAuthClient {
    http: reqwest::Client,
    discovery: DiscoveryClient,
    tokens: TokenStore,
    /// Server configs relevant to auth, refreshed on every reconcile
    servers: RwLock<HashMap<String, ServerConfig>>,
    /// Cached authorization-server metadata keyed by issuer
    metadata_cache: RwLock<HashMap<String, AuthServerMetadata>>,
}

impl OAuthClient {
    pub fn new(tokens: TokenStore) -> AuthResult<Arc<Self>> {
        // Redirects disabled on token requests (SSRF hardening)
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Arc::new(Self {
            http,
            discovery: DiscoveryClient::new()?,
            tokens,
            servers: RwLock::new(HashMap::new()),
            metadata_cache: RwLock::new(HashMap::new()),
        }))
    }

    /// Keep the auth-relevant view of server configs current
    pub fn update_servers(&self, configs: &[ServerConfig]) {
        let mut servers = self.servers.write();
        servers.clear();
        for config in configs {
            servers.insert(config.name.clone(), config.clone());
        }
    }

    fn server_config(&self, server: &str) -> AuthResult<ServerConfig> {
        self.servers
            .read()
            .get(server)
            .cloned()
            .ok_or_else(|| AuthError::Configuration(format!("unknown server '{}'", server)))
    }

    /// Stored token set for a server, if any
    pub fn stored_tokens(&self, server: &str) -> AuthResult<Option<TokenSet>> {
        Ok(self.tokens.get_for_server(server)?)
    }

    /// Valid access token for a server, refreshing when close to expiry
    pub async fn access_token(&self, server: &str) -> Option<String> {
        let tokens = self.tokens.get_for_server(server).ok()??;

        let near_expiry = tokens
            .expires_at
            .is_some_and(|exp| Utc::now() + ChronoDuration::seconds(EXPIRY_SLACK_SECS) >= exp);
        if !near_expiry {
            return Some(tokens.access_token);
        }

        match self.refresh(server).await {
            Ok(refreshed) => Some(refreshed.access_token),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "Token refresh failed");
                None
            }
        }
    }

    async fn auth_server_metadata(&self, issuer: &str) -> AuthResult<AuthServerMetadata> {
        if let Some(cached) = self.metadata_cache.read().get(issuer).cloned() {
            return Ok(cached);
        }
        let metadata = self.discovery.auth_server(issuer).await?;
        self.metadata_cache
            .write()
            .insert(issuer.to_string(), metadata.clone());
        Ok(metadata)
    }

    /// Discover the authorization server for an upstream
    ///
    /// Runs RFC 9728 discovery from the challenge URL or the upstream's own
    /// URL; falls back to treating the server URL as both resource and
    /// issuer when no metadata is published.
    pub async fn discover(
        &self,
        server: &str,
        www_authenticate: Option<&str>,
    ) -> AuthResult<(AuthServerMetadata, Option<String>)> {
        let config = self.server_config(server)?;
        let server_url = config
            .url
            .clone()
            .ok_or_else(|| AuthError::Configuration(format!("server '{}' has no URL", server)))?;

        let challenge_url = www_authenticate.and_then(parse_resource_metadata_challenge);

        match self
            .discovery
            .protected_resource(&server_url, challenge_url.as_deref())
            .await
        {
            Ok(prm) => {
                let issuer = prm
                    .authorization_servers
                    .first()
                    .cloned()
                    .ok_or_else(|| {
                        AuthError::Discovery("resource metadata lists no authorization servers".into())
                    })?;
                let metadata = self.auth_server_metadata(&issuer).await?;
                Ok((metadata, Some(prm.resource)))
            }
            Err(_) => {
                // No PRM published: the server URL doubles as the resource
                let metadata = self.auth_server_metadata(&server_url).await?;
                Ok((metadata, Some(server_url)))
            }
        }
    }

    /// Begin an interactive login: returns the URL to open and the pending
    /// authorization to await
    pub async fn begin_login(
        &self,
        server: &str,
        www_authenticate: Option<&str>,
    ) -> AuthResult<PendingAuthorization> {
        let config = self.server_config(server)?;
        let oauth = config.oauth.clone().unwrap_or_default();
        let (metadata, resource) = self.discover(server, www_authenticate).await?;

        // Bind the loopback listener first so registration can name it
        let scopes = if oauth.scopes.is_empty() {
            metadata.scopes_supported.clone()
        } else {
            oauth.scopes.clone()
        };

        let client_id = match oauth.client_id.clone() {
            Some(client_id) => client_id,
            None => {
                let registration_endpoint =
                    metadata.registration_endpoint.clone().ok_or_else(|| {
                        AuthError::Registration(
                            "no client_id configured and the server offers no registration endpoint"
                                .into(),
                        )
                    })?;
                // Loopback redirects are port-agnostic per RFC 8252 §7.3;
                // register the canonical form.
                let request =
                    RegistrationRequest::public_client("http://127.0.0.1/callback", &scopes);
                let response = dcr::register(&self.http, &registration_endpoint, &request).await?;
                response.client_id
            }
        };

        PendingAuthorization::begin(
            server,
            &metadata,
            &client_id,
            &scopes,
            resource,
            &oauth.extra_params,
        )
        .await
    }

    /// Complete a login by waiting for the callback, then persist the tokens
    pub async fn finish_login(
        &self,
        pending: PendingAuthorization,
        timeout: std::time::Duration,
    ) -> AuthResult<TokenSet> {
        let AuthFlowResult { tokens } = pending.wait_and_exchange(&self.http, timeout).await?;
        self.tokens.put(&tokens)?;
        Ok(tokens)
    }

    /// Refresh the stored token set for a server
    pub async fn refresh(&self, server: &str) -> AuthResult<TokenSet> {
        let tokens = self
            .tokens
            .get_for_server(server)?
            .ok_or_else(|| AuthError::NoTokens(server.to_string()))?;

        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::NoTokens(format!("{} (no refresh token)", server)))?;

        let metadata = self.auth_server_metadata(&tokens.auth_server_url).await?;
        let token_endpoint = metadata.require_token_endpoint()?;

        let client = BasicClient::new(ClientId::new(tokens.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(metadata.authorization_endpoint.clone())
                    .map_err(|e| AuthError::Configuration(e.to_string()))?,
            )
            .set_token_uri(
                TokenUrl::new(token_endpoint.to_string())
                    .map_err(|e| AuthError::Configuration(e.to_string()))?,
            );

        let refresh_token_value = RefreshToken::new(refresh_token.clone());
        let mut request = client.exchange_refresh_token(&refresh_token_value);
        if let Some(resource) = &tokens.resource {
            request = request.add_extra_param("resource", resource.clone());
        }

        let response = request
            .request_async(&self.http)
            .await
            .map_err(map_token_error)?;

        let issued_at = Utc::now();
        let refreshed = TokenSet {
            access_token: response.access_token().secret().clone(),
            // Servers may rotate the refresh token; keep the old one otherwise
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(Some(refresh_token)),
            expires_at: response
                .expires_in()
                .map(|d| issued_at + ChronoDuration::from_std(d).unwrap_or_default()),
            issued_at,
            ..tokens
        };
        self.tokens.put(&refreshed)?;
        Ok(refreshed)
    }

    /// Drop the stored tokens for a server
    pub fn logout(&self, server: &str) -> AuthResult<usize> {
        Ok(self.tokens.delete_for_server(server)?)
    }
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_storage::ProxyDb;

    fn client() -> Arc<OAuthClient> {
        OAuthClient::new(TokenStore::new(ProxyDb::open_temporary().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_server_is_a_configuration_error() {
        let client = client();
        let err = client.begin_login("nope", None).await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_refresh_without_tokens_is_terminal() {
        let client = client();
        let err = client.refresh("gh").await.unwrap_err();
        assert!(matches!(err, AuthError::NoTokens(_)));
        assert_eq!(err.class(), crate::error::AuthErrorClass::Terminal);
    }

    #[tokio::test]
    async fn test_access_token_returns_stored_unexpired_token() {
        let store = TokenStore::new(ProxyDb::open_temporary().unwrap());
        let tokens = TokenSet {
            server_name: "gh".into(),
            auth_server_url: "https://auth.example.com".into(),
            access_token: "at-1".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            issued_at: Utc::now(),
            scope: None,
            client_id: "c".into(),
            resource: None,
        };
        store.put(&tokens).unwrap();

        let client = OAuthClient::new(store).unwrap();
        assert_eq!(client.access_token("gh").await.as_deref(), Some("at-1"));
    }
}
