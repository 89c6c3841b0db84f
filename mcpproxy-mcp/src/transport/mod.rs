//! Transport layer for upstream MCP communication

pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::session::StderrSink;
use mcpproxy_config::{ServerConfig, UpstreamProtocol};

/// Transport trait for upstream MCP communication
///
/// `request` takes `&self`: HTTP transports run concurrent in-flight requests
/// correlated by ID, while the stdio transport serializes internally (the
/// pipe carries one outstanding request at a time).
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establish the connection
    async fn connect(&mut self) -> McpResult<()>;

    /// Send a request and wait for its response
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()>;

    /// Whether the transport currently has a live connection
    fn is_connected(&self) -> bool;

    /// Install a bearer token used on subsequent requests (HTTP transports)
    fn set_bearer_token(&self, _token: Option<String>) {}

    /// Session identifier assigned by the upstream, when the transport has one
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Close the connection
    async fn close(&mut self) -> McpResult<()>;
}

/// Transport factory for creating transport instances from server config
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport for the given upstream configuration
    ///
    /// `stderr_sink` receives subprocess stderr lines (stdio transport only).
    pub fn create(
        config: &ServerConfig,
        stderr_sink: Option<StderrSink>,
    ) -> McpResult<Box<dyn McpTransport>> {
        match config.protocol {
            UpstreamProtocol::Stdio => {
                let command = config.command.clone().ok_or_else(|| McpError::Configuration {
                    message: format!("stdio server '{}' has no command", config.name),
                })?;
                Ok(Box::new(StdioTransport::new(
                    command,
                    config.args.clone(),
                    config.env.clone(),
                    config.cwd.clone(),
                    stderr_sink,
                )?))
            }
            UpstreamProtocol::Http => {
                let url = require_url(config)?;
                Ok(Box::new(StreamableHttpTransport::new(
                    url,
                    config.headers.clone(),
                )?))
            }
            UpstreamProtocol::Sse => {
                let url = require_url(config)?;
                Ok(Box::new(SseTransport::new(url, config.headers.clone())?))
            }
        }
    }
}

fn require_url(config: &ServerConfig) -> McpResult<String> {
    config.url.clone().ok_or_else(|| McpError::Configuration {
        message: format!("{} server '{}' has no url", config.protocol.as_str(), config.name),
    })
}

/// Build a reqwest client with the default headers shared by HTTP transports
///
/// `timeout` of `None` disables the overall request timeout (long-lived SSE
/// streams must not be cut off).
pub(crate) fn build_http_client(
    headers: &HashMap<String, String>,
    timeout: Option<std::time::Duration>,
) -> McpResult<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            McpError::Configuration {
                message: format!("invalid header name '{}': {}", name, e),
            }
        })?;
        let value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
            McpError::Configuration {
                message: format!("invalid header value for '{}': {}", name, e),
            }
        })?;
        header_map.insert(name, value);
    }

    let mut builder = reqwest::Client::builder().default_headers(header_map);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|e| McpError::Configuration {
        message: format!("failed to create HTTP client: {}", e),
    })
}

/// Extract a 401 challenge into the error the auth subsystem understands
pub(crate) fn unauthorized_from_response(response: &reqwest::Response) -> McpError {
    let www_authenticate = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    McpError::Unauthorized { www_authenticate }
}
