//! PKCE authorization-code flow with loopback callback
//!
//! The flow binds a listener on an ephemeral loopback port first, so the
//! redirect URI is known before registration and authorization begin. The
//! `state` parameter is the oauth2 crate's 128-bit random CSRF token, bound
//! to the pending authorization and checked on callback.

use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, CsrfToken, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::discovery::AuthServerMetadata;
use crate::error::{AuthError, AuthResult};
use mcpproxy_storage::TokenSet;

/// Outcome of the loopback callback request
#[derive(Debug)]
struct CallbackOutcome {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Completed flow result
#[derive(Debug, Clone)]
pub struct AuthFlowResult {
    pub tokens: TokenSet,
}

/// An authorization waiting for its loopback callback
#[derive(Debug)]
pub struct PendingAuthorization {
    /// URL the user must open in a browser
    pub auth_url: String,

    /// Loopback address receiving the callback
    pub callback_addr: std::net::SocketAddr,

    /// CSRF state bound to this authorization
    pub state: String,

    server_name: String,
    auth_server_url: String,
    client_id: String,
    token_endpoint: String,
    redirect_uri: String,
    resource: Option<String>,
    scope: Option<String>,
    pkce_verifier: PkceCodeVerifier,
    callback_rx: mpsc::Receiver<CallbackOutcome>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl PendingAuthorization {
    /// Start the loopback listener and build the authorization URL
    ///
    /// `extra_params` merges auto-detected parameters (`resource` from PRM)
    /// with manual overrides from the server config; manual wins.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin(
        server_name: &str,
        metadata: &AuthServerMetadata,
        client_id: &str,
        scopes: &[String],
        resource: Option<String>,
        extra_params: &HashMap<String, String>,
    ) -> AuthResult<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AuthError::Flow(format!("failed to bind loopback listener: {}", e)))?;
        let callback_addr = listener
            .local_addr()
            .map_err(|e| AuthError::Flow(e.to_string()))?;
        let redirect_uri = format!("http://{}/callback", callback_addr);

        let token_endpoint = metadata.require_token_endpoint()?.to_string();
        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_auth_uri(
                AuthUrl::new(metadata.authorization_endpoint.clone())
                    .map_err(|e| AuthError::Configuration(format!("authorization_endpoint: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(token_endpoint.clone())
                    .map_err(|e| AuthError::Configuration(format!("token_endpoint: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.clone())
                    .map_err(|e| AuthError::Configuration(format!("redirect_uri: {}", e)))?,
            );

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if let Some(resource) = &resource {
            if !extra_params.contains_key("resource") {
                request = request.add_extra_param("resource", resource.clone());
            }
        }
        for (key, value) in extra_params {
            request = request.add_extra_param(key.clone(), value.clone());
        }

        let (auth_url, csrf_state) = request.url();

        let (callback_tx, callback_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(serve_callback(listener, callback_tx, shutdown_rx));

        Ok(Self {
            auth_url: auth_url.to_string(),
            callback_addr,
            state: csrf_state.secret().clone(),
            server_name: server_name.to_string(),
            auth_server_url: metadata.issuer.clone(),
            client_id: client_id.to_string(),
            token_endpoint,
            redirect_uri,
            resource,
            scope: if scopes.is_empty() {
                None
            } else {
                Some(scopes.join(" "))
            },
            pkce_verifier,
            callback_rx,
            _shutdown_tx: shutdown_tx,
        })
    }

    /// Wait for the callback and exchange the code for tokens
    pub async fn wait_and_exchange(
        mut self,
        http: &reqwest::Client,
        timeout: Duration,
    ) -> AuthResult<AuthFlowResult> {
        let outcome = tokio::time::timeout(timeout, self.callback_rx.recv())
            .await
            .map_err(|_| AuthError::Flow("authorization timed out".into()))?
            .ok_or_else(|| AuthError::Flow("callback listener closed".into()))?;

        if let Some(error) = outcome.error {
            return Err(AuthError::OAuth {
                error,
                description: "authorization denied".into(),
            });
        }
        if outcome.state.as_deref() != Some(self.state.as_str()) {
            return Err(AuthError::Flow("state mismatch on callback".into()));
        }
        let code = outcome
            .code
            .ok_or_else(|| AuthError::Flow("callback carried no code".into()))?;

        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new("http://unused.invalid/authorize".to_string())
                    .map_err(|e| AuthError::Configuration(e.to_string()))?,
            )
            .set_token_uri(
                TokenUrl::new(self.token_endpoint.clone())
                    .map_err(|e| AuthError::Configuration(e.to_string()))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_uri.clone())
                    .map_err(|e| AuthError::Configuration(e.to_string()))?,
            );

        let mut exchange = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(self.pkce_verifier);
        if let Some(resource) = &self.resource {
            exchange = exchange.add_extra_param("resource", resource.clone());
        }

        let response = exchange
            .request_async(http)
            .await
            .map_err(map_token_error)?;

        let issued_at = Utc::now();
        let tokens = TokenSet {
            server_name: self.server_name,
            auth_server_url: self.auth_server_url,
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_at: response
                .expires_in()
                .map(|d| issued_at + chrono::Duration::from_std(d).unwrap_or_default()),
            issued_at,
            scope: response
                .scopes()
                .map(|scopes| {
                    scopes
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .or(self.scope),
            client_id: self.client_id,
            resource: self.resource,
        };

        Ok(AuthFlowResult { tokens })
    }
}

/// Map oauth2 crate token errors onto the auth error taxonomy
pub(crate) fn map_token_error<RE, TE>(error: oauth2::RequestTokenError<RE, TE>) -> AuthError
where
    RE: std::error::Error + 'static,
    TE: oauth2::ErrorResponse + 'static,
{
    match error {
        oauth2::RequestTokenError::ServerResponse(response) => {
            let body = serde_json::to_value(&response).unwrap_or_default();
            let code = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let description = body
                .get("error_description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            AuthError::OAuth {
                error: code,
                description,
            }
        }
        oauth2::RequestTokenError::Request(e) => AuthError::Network(e.to_string()),
        oauth2::RequestTokenError::Parse(e, _) => AuthError::Flow(format!("token parse: {}", e)),
        oauth2::RequestTokenError::Other(e) => AuthError::Flow(e),
    }
}

/// Serve exactly one callback request on the loopback listener
async fn serve_callback(
    listener: tokio::net::TcpListener,
    callback_tx: mpsc::Sender<CallbackOutcome>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    use axum::{extract::Query, response::Html, routing::get, Router};

    let app = Router::new().route(
        "/callback",
        get(move |Query(query): Query<CallbackQuery>| {
            let callback_tx = callback_tx.clone();
            async move {
                let outcome = CallbackOutcome {
                    code: query.code,
                    state: query.state,
                    error: query.error.map(|e| {
                        match query.error_description {
                            Some(desc) => format!("{}: {}", e, desc),
                            None => e,
                        }
                    }),
                };
                let _ = callback_tx.send(outcome).await;
                Html("<html><body>Authorization received. You may close this window.</body></html>")
            }
        }),
    );

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    if let Err(e) = serve.await {
        tracing::debug!(error = %e, "Loopback callback server exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> AuthServerMetadata {
        serde_json::from_value(serde_json::json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
            "code_challenge_methods_supported": ["S256"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_begin_builds_pkce_auth_url() {
        let pending = PendingAuthorization::begin(
            "gh",
            &metadata(),
            "client-1",
            &["mcp".to_string()],
            Some("https://api.example.com".to_string()),
            &HashMap::new(),
        )
        .await
        .unwrap();

        let url = url::Url::parse(&pending.auth_url).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert_eq!(
            params.get("resource").map(String::as_str),
            Some("https://api.example.com")
        );
        assert!(params.contains_key("code_challenge"));
        assert_eq!(params.get("state"), Some(&pending.state));
        assert!(params
            .get("redirect_uri")
            .unwrap()
            .starts_with("http://127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_callback_state_mismatch_rejected() {
        let pending = PendingAuthorization::begin(
            "gh",
            &metadata(),
            "client-1",
            &[],
            None,
            &HashMap::new(),
        )
        .await
        .unwrap();

        let callback = format!(
            "http://{}/callback?code=abc&state=wrong-state",
            pending.callback_addr
        );
        let http = reqwest::Client::new();
        http.get(&callback).send().await.unwrap();

        let err = pending
            .wait_and_exchange(&http, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Flow(_)));
    }
}
