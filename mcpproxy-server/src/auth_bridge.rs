//! Bridge between the upstream session layer and the OAuth subsystem
//!
//! Sessions know nothing about OAuth beyond the `BearerTokenProvider`
//! trait; this adapter satisfies it from the `OAuthClient`.

use async_trait::async_trait;
use std::sync::Arc;

use mcpproxy_auth::OAuthClient;
use mcpproxy_mcp::BearerTokenProvider;

/// `BearerTokenProvider` backed by the OAuth client
pub struct OAuthBridge {
    oauth: Arc<OAuthClient>,
}

impl OAuthBridge {
    pub fn new(oauth: Arc<OAuthClient>) -> Self {
        Self { oauth }
    }
}

#[async_trait]
impl BearerTokenProvider for OAuthBridge {
    async fn bearer_token(&self, server: &str) -> Option<String> {
        self.oauth.access_token(server).await
    }

    async fn on_unauthorized(
        &self,
        server: &str,
        _www_authenticate: Option<&str>,
    ) -> Option<String> {
        // A refresh may rescue the session without user interaction; an
        // interactive login cannot run here, so anything else holds the
        // session until `auth login`.
        match self.oauth.refresh(server).await {
            Ok(tokens) => Some(tokens.access_token),
            Err(e) => {
                tracing::info!(server = %server, error = %e, "Upstream needs interactive authorization");
                None
            }
        }
    }
}
