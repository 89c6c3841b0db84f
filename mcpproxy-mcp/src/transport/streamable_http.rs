//! Streamable HTTP client transport
//!
//! Requests go out as POSTs carrying one JSON-RPC message; the response is
//! either a plain JSON body or a short-lived SSE stream whose first matching
//! `data:` frame is the response. The upstream may assign a session via the
//! `Mcp-Session-Id` header, echoed on every subsequent request.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use super::{build_http_client, unauthorized_from_response, McpTransport};
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable HTTP transport for remote MCP servers
pub struct StreamableHttpTransport {
    /// MCP endpoint URL
    url: String,

    /// HTTP client with the configured default headers
    client: reqwest::Client,

    /// Bearer token installed by the OAuth subsystem
    bearer_token: RwLock<Option<String>>,

    /// Session ID assigned by the upstream
    session_id: RwLock<Option<String>>,

    /// Whether the transport is connected
    connected: AtomicBool,
}

impl StreamableHttpTransport {
    /// Create a new streamable HTTP transport
    pub fn new(url: String, headers: HashMap<String, String>) -> McpResult<Self> {
        validate_http_url(&url)?;
        let client = build_http_client(&headers, Some(Duration::from_secs(60)))?;

        Ok(Self {
            url,
            client,
            bearer_token: RwLock::new(None),
            session_id: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn apply_auth(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = self.bearer_token.read().as_ref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(session) = self.session_id.read().as_ref() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    async fn post(&self, body: &JsonRpcRequest) -> McpResult<reqwest::Response> {
        let builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);

        let response = self
            .apply_auth(builder)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("POST failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(unauthorized_from_response(&response));
        }
        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "Upstream returned HTTP {}",
                response.status()
            )));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() =
                Some(session.to_string());
        }

        Ok(response)
    }

    /// Read an SSE response stream until the frame answering `expected_id`
    async fn read_event_stream(
        response: reqwest::Response,
        expected_id: &Option<serde_json::Value>,
    ) -> McpResult<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::transport(format!("Stream error: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are separated by a blank line
            while let Some(pos) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..pos + 2).collect();
                for line in frame.lines() {
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data.trim()) {
                        if &parsed.id == expected_id {
                            return Ok(parsed);
                        }
                    }
                }
            }
        }

        Err(McpError::transport(
            "Event stream ended without a matching response",
        ))
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn connect(&mut self) -> McpResult<()> {
        // Nothing to pre-establish; the first POST opens the session.
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("Transport not connected"));
        }

        let expected_id = request.id.clone();
        let response = self.post(&request).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            Self::read_event_stream(response, &expected_id).await
        } else {
            response
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| McpError::serialization(format!("Failed to parse response: {}", e)))
        }
    }

    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
        self.post(&notification).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write() = token;
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    async fn close(&mut self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn validate_http_url(url: &str) -> McpResult<()> {
    let parsed = url::Url::parse(url).map_err(|e| McpError::Configuration {
        message: format!("Invalid URL: {}", e),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(McpError::Configuration {
            message: format!(
                "Unsupported URL scheme: {}. Only http and https are allowed.",
                scheme
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(validate_http_url("https://example.com/mcp").is_ok());
        assert!(validate_http_url("file:///etc/passwd").is_err());
        assert!(validate_http_url("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_request_before_connect_fails() {
        let transport =
            StreamableHttpTransport::new("https://example.com/mcp".into(), HashMap::new()).unwrap();
        let err = transport
            .request(JsonRpcRequest::with_id("ping", None, "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }
}
