//! MCP error types

use std::time::Duration;
use thiserror::Error;

/// MCP result type
pub type McpResult<T> = Result<T, McpError>;

/// Errors raised by transports and upstream sessions
#[derive(Error, Debug)]
pub enum McpError {
    /// Transport-level failure (pipe broke, stream closed)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Could not establish the connection at all
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Upstream demanded authorization
    ///
    /// `www_authenticate` carries the raw challenge header when present so
    /// the OAuth subsystem can run resource-metadata discovery on it.
    #[error("Upstream requires authorization")]
    Unauthorized { www_authenticate: Option<String> },

    /// JSON-RPC error response from the upstream
    ///
    /// The session stays healthy; the error propagates to the caller as-is.
    #[error("Upstream error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// Message could not be serialized or parsed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Operation exceeded its deadline
    #[error("Upstream timed out after {timeout:?}")]
    ServerTimeout { timeout: Duration },

    /// Invalid transport or server configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Session is closed or closing
    #[error("Session closed")]
    SessionClosed,

    /// Operation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,
}

impl McpError {
    /// Whether the session should reconnect after this error
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. } | McpError::ConnectionFailed { .. }
        )
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        McpError::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(message: impl std::fmt::Display) -> Self {
        McpError::Serialization {
            message: message.to_string(),
        }
    }
}
