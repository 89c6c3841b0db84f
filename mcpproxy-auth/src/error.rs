//! Auth error types and failure classification

use thiserror::Error;

/// Auth result type
pub type AuthResult<T> = Result<T, AuthError>;

/// How a failure should be handled by the refresh scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorClass {
    /// Retry with backoff (network, DNS, transient 5xx)
    Transient,
    /// Stop, notify, require user action (invalid_grant, invalid_client)
    Terminal,
    /// Restart the authorization flow (401 without resource metadata)
    NeedsReauth,
    /// Not retried
    FailedOther,
}

/// Errors raised by the OAuth subsystem
#[derive(Error, Debug)]
pub enum AuthError {
    /// Network-level failure talking to an OAuth endpoint
    #[error("OAuth network error: {0}")]
    Network(String),

    /// OAuth error response from the authorization server
    #[error("OAuth server error '{error}': {description}")]
    OAuth { error: String, description: String },

    /// 401 challenge that did not carry protected-resource metadata
    #[error("Unauthorized without resource metadata")]
    NeedsReauth,

    /// Discovery documents missing or malformed
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Dynamic client registration failed
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// Authorization-code flow failed (state mismatch, denied, timeout)
    #[error("Authorization flow failed: {0}")]
    Flow(String),

    /// Token store failure
    #[error("Token storage error: {0}")]
    Storage(#[from] mcpproxy_storage::StorageError),

    /// No token on file for the server
    #[error("No tokens stored for server '{0}'")]
    NoTokens(String),

    /// Configuration problem (bad URLs, missing fields)
    #[error("Auth configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    /// Classify per the refresh scheduler's decision table
    pub fn class(&self) -> AuthErrorClass {
        match self {
            AuthError::Network(_) => AuthErrorClass::Transient,
            AuthError::OAuth { error, .. } => match error.as_str() {
                "invalid_grant" | "invalid_client" => AuthErrorClass::Terminal,
                "server_error" | "temporarily_unavailable" => AuthErrorClass::Transient,
                _ => AuthErrorClass::FailedOther,
            },
            AuthError::NeedsReauth => AuthErrorClass::NeedsReauth,
            AuthError::NoTokens(_) => AuthErrorClass::Terminal,
            _ => AuthErrorClass::FailedOther,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(
            AuthError::Network("dns".into()).class(),
            AuthErrorClass::Transient
        );
        assert_eq!(
            AuthError::OAuth {
                error: "invalid_grant".into(),
                description: String::new()
            }
            .class(),
            AuthErrorClass::Terminal
        );
        assert_eq!(
            AuthError::OAuth {
                error: "temporarily_unavailable".into(),
                description: String::new()
            }
            .class(),
            AuthErrorClass::Transient
        );
        assert_eq!(AuthError::NeedsReauth.class(), AuthErrorClass::NeedsReauth);
        assert_eq!(
            AuthError::Flow("denied".into()).class(),
            AuthErrorClass::FailedOther
        );
    }
}
