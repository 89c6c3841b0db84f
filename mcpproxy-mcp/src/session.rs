//! Per-upstream session state machine
//!
//! One `UpstreamSession` supervises one upstream server: it owns the
//! transport, runs the connect/initialize/list-tools handshake, keeps the
//! session alive with pings, reconnects with backoff, and turns 401
//! challenges into OAuth flows via the injected token provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};

use crate::error::{McpError, McpResult};
use crate::protocol::{
    self, methods, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcRequest, Tool, ToolCallParams, ToolCallResult, ToolContent, ToolsListResult,
};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{McpTransport, TransportFactory};
use mcpproxy_config::ServerConfig;

/// Receives stderr lines from stdio subprocesses
pub type StderrSink = Arc<dyn Fn(String) + Send + Sync>;

/// Ping cadence while a session is ready
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Per-ping timeout; two consecutive misses fault the session
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies bearer tokens for upstreams behind OAuth
#[async_trait]
pub trait BearerTokenProvider: Send + Sync {
    /// Token already on file for this server, refreshed if stale
    async fn bearer_token(&self, server: &str) -> Option<String>;

    /// Called on a 401 challenge; runs discovery and refresh
    ///
    /// Returns a fresh token, or `None` when interactive authorization is
    /// required (the session then holds in `error` until user action).
    async fn on_unauthorized(&self, server: &str, www_authenticate: Option<&str>)
        -> Option<String>;
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Connecting,
    Authenticating,
    Ready,
    Error,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Snapshot of a session's observable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    pub tool_count: usize,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Session holds in error until user action (terminal auth failure)
    #[serde(default)]
    pub held: bool,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            state: SessionState::Created,
            connected: false,
            tool_count: 0,
            retry_count: 0,
            last_error: None,
            server_info: None,
            session_id: None,
            held: false,
        }
    }
}

struct SessionInner {
    config: ServerConfig,
    effective_response_limit: usize,
    transport: RwLock<Box<dyn McpTransport>>,
    tools: RwLock<Vec<Tool>>,
    status_tx: watch::Sender<SessionStatus>,
    auth: Option<Arc<dyn BearerTokenProvider>>,
    policy: ReconnectPolicy,
    /// Wakes a held session (user-triggered restart)
    kick: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to one supervised upstream session
#[derive(Clone)]
pub struct UpstreamSession {
    inner: Arc<SessionInner>,
}

impl UpstreamSession {
    /// Create a session; `start` must be called to begin connecting
    pub fn new(
        config: ServerConfig,
        default_response_limit: usize,
        auth: Option<Arc<dyn BearerTokenProvider>>,
        stderr_sink: Option<StderrSink>,
    ) -> McpResult<Self> {
        let effective_response_limit =
            config.tool_response_limit.unwrap_or(default_response_limit);
        let transport = TransportFactory::create(&config, stderr_sink)?;
        let (status_tx, _) = watch::channel(SessionStatus::initial());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                effective_response_limit,
                transport: RwLock::new(transport),
                tools: RwLock::new(Vec::new()),
                status_tx,
                auth,
                policy: ReconnectPolicy::default(),
                kick: Notify::new(),
                shutdown_tx,
            }),
        })
    }

    /// Server name this session belongs to
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration the session was built from
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Current status snapshot
    pub fn status(&self) -> SessionStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Discovered tools (empty until ready)
    pub async fn tools(&self) -> Vec<Tool> {
        self.inner.tools.read().await.clone()
    }

    /// Spawn the supervision task
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            session.run().await;
        })
    }

    /// Wake a session held in error and reset its retry counter
    pub fn kick(&self) {
        self.update_status(|s| {
            s.retry_count = 0;
            s.held = false;
        });
        self.inner.kick.notify_waiters();
    }

    /// Close the session; terminal
    pub async fn close(&self) {
        self.update_status(|s| s.state = SessionState::Closing);
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.kick.notify_waiters();

        let mut transport = self.inner.transport.write().await;
        if let Err(e) = transport.close().await {
            tracing::debug!(server = %self.name(), error = %e, "Transport close failed");
        }
        self.update_status(|s| {
            s.state = SessionState::Closed;
            s.connected = false;
        });
    }

    /// Call a tool on this upstream
    ///
    /// The response is truncated at the server's response cap; a truncated
    /// response gets a trailing marker block.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> McpResult<ToolCallResult> {
        if self.status().state != SessionState::Ready {
            return Err(McpError::transport(format!(
                "Upstream '{}' is not ready",
                self.name()
            )));
        }

        let params = ToolCallParams {
            name: tool_name.to_string(),
            arguments,
        };
        let request = JsonRpcRequest::new(
            methods::TOOLS_CALL,
            Some(serde_json::to_value(&params).map_err(McpError::serialization)?),
            Some(protocol::generate_request_id()),
        );

        let response = {
            let transport = self.inner.transport.read().await;
            tokio::time::timeout(timeout, transport.request(request))
                .await
                .map_err(|_| McpError::ServerTimeout { timeout })??
        };

        if let Some(error) = response.error {
            return Err(McpError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        let result: ToolCallResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::serialization("tools/call response without result"))?,
        )
        .map_err(McpError::serialization)?;

        Ok(truncate_result(result, self.inner.effective_response_limit))
    }

    /// Re-fetch the upstream's tool list
    pub async fn refresh_tools(&self) -> McpResult<Vec<Tool>> {
        let request = JsonRpcRequest::new(
            methods::TOOLS_LIST,
            None,
            Some(protocol::generate_request_id()),
        );

        let response = {
            let transport = self.inner.transport.read().await;
            transport.request(request).await?
        };

        if let Some(error) = response.error {
            return Err(McpError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        let result: ToolsListResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::serialization("tools/list response without result"))?,
        )
        .map_err(McpError::serialization)?;

        *self.inner.tools.write().await = result.tools.clone();
        self.update_status(|s| s.tool_count = result.tools.len());
        Ok(result.tools)
    }

    fn update_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        self.inner.status_tx.send_modify(f);
    }

    fn is_shutdown(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Supervision loop: connect, serve pings, reconnect on faults
    async fn run(&self) {
        let mut attempt: u32 = 0;
        let mut auth_attempts: u32 = 0;

        loop {
            if self.is_shutdown() {
                return;
            }

            self.update_status(|s| {
                s.state = SessionState::Connecting;
                s.connected = false;
            });

            match self.establish().await {
                Ok(init) => {
                    attempt = 0;
                    auth_attempts = 0;
                    let session_id = self.inner.transport.read().await.session_id();
                    self.update_status(|s| {
                        s.state = SessionState::Ready;
                        s.connected = true;
                        s.retry_count = 0;
                        s.last_error = None;
                        s.held = false;
                        s.server_info = Some(format!(
                            "{} {}",
                            init.server_info.name, init.server_info.version
                        ));
                        s.session_id = session_id;
                    });
                    tracing::info!(server = %self.name(), "Upstream ready");

                    // Blocks until the session faults or shuts down
                    self.ping_loop().await;
                    if self.is_shutdown() {
                        return;
                    }
                }
                Err(McpError::Unauthorized { www_authenticate }) => {
                    self.update_status(|s| s.state = SessionState::Authenticating);

                    // A refreshed token the server still rejects means the
                    // credentials are not the problem; stop retrying.
                    auth_attempts += 1;
                    let token = match &self.inner.auth {
                        Some(auth) if auth_attempts <= 2 => {
                            auth.on_unauthorized(self.name(), www_authenticate.as_deref())
                                .await
                        }
                        _ => None,
                    };

                    match token {
                        Some(token) => {
                            self.inner
                                .transport
                                .read()
                                .await
                                .set_bearer_token(Some(token));
                            // Retry the connect immediately with credentials
                            continue;
                        }
                        None => {
                            self.update_status(|s| {
                                s.state = SessionState::Error;
                                s.last_error =
                                    Some("authorization required; run auth login".to_string());
                                s.held = true;
                            });
                            // Hold until user action
                            self.inner.kick.notified().await;
                            auth_attempts = 0;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.inner.policy.next_delay(attempt - 1);
                    tracing::warn!(
                        server = %self.name(),
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Upstream connect failed, will retry"
                    );
                    self.update_status(|s| {
                        s.state = SessionState::Error;
                        s.connected = false;
                        s.retry_count = attempt;
                        s.last_error = Some(e.to_string());
                    });

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.inner.kick.notified() => { attempt = 0; }
                    }
                }
            }
        }
    }

    /// Transport connect + MCP handshake + initial tool discovery
    async fn establish(&self) -> McpResult<InitializeResult> {
        if let Some(auth) = &self.inner.auth {
            if let Some(token) = auth.bearer_token(self.name()).await {
                self.inner.transport.read().await.set_bearer_token(Some(token));
            }
        }

        {
            let mut transport = self.inner.transport.write().await;
            transport.connect().await?;
        }

        let params = InitializeParams {
            protocol_version: crate::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "mcpproxy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let request = JsonRpcRequest::new(
            methods::INITIALIZE,
            Some(serde_json::to_value(&params).map_err(McpError::serialization)?),
            Some(protocol::generate_request_id()),
        );

        let response = {
            let transport = self.inner.transport.read().await;
            transport.request(request).await?
        };

        if let Some(error) = response.error {
            return Err(McpError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        let init: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::serialization("initialize response without result"))?,
        )
        .map_err(McpError::serialization)?;

        {
            let transport = self.inner.transport.read().await;
            transport
                .notify(JsonRpcRequest::notification(methods::INITIALIZED, None))
                .await?;
        }

        self.refresh_tools().await?;
        Ok(init)
    }

    /// Periodic ping; two consecutive misses fault the session
    async fn ping_loop(&self) {
        let mut misses = 0u32;
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => return,
            }

            let request = JsonRpcRequest::new(
                methods::PING,
                Some(json!({})),
                Some(protocol::generate_request_id()),
            );
            let result = {
                let transport = self.inner.transport.read().await;
                tokio::time::timeout(PING_TIMEOUT, transport.request(request)).await
            };

            match result {
                Ok(Ok(_)) => {
                    misses = 0;
                }
                Ok(Err(e)) if !e.is_transport_fault() => {
                    // Protocol-level refusal still proves the pipe is alive
                    misses = 0;
                }
                _ => {
                    misses += 1;
                    tracing::debug!(server = %self.name(), misses, "Ping missed");
                    if misses >= 2 {
                        self.update_status(|s| {
                            s.state = SessionState::Error;
                            s.connected = false;
                            s.last_error = Some("ping timeout".to_string());
                        });
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("name", &self.name())
            .field("state", &self.status().state)
            .finish()
    }
}

/// Truncate a tool result's text content at `cap` bytes
///
/// A result exactly at the cap passes untouched; one byte over is cut at a
/// char boundary and flagged with a trailing marker block.
pub fn truncate_result(mut result: ToolCallResult, cap: usize) -> ToolCallResult {
    let total: usize = result
        .content
        .iter()
        .map(|block| match block {
            ToolContent::Text { text } => text.len(),
            _ => 0,
        })
        .sum();

    if total <= cap {
        return result;
    }

    let mut budget = cap;
    for block in &mut result.content {
        if let ToolContent::Text { text } = block {
            if text.len() <= budget {
                budget -= text.len();
            } else {
                let mut cut = budget;
                while cut > 0 && !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
                budget = 0;
            }
        }
    }
    result.content.push(ToolContent::Text {
        text: format!("(truncated at {} bytes)", cap),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_result(text: &str) -> ToolCallResult {
        ToolCallResult::text(text)
    }

    #[test]
    fn test_truncation_boundary() {
        // Exactly at cap: untouched
        let result = truncate_result(text_result("abcd"), 4);
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.text_content(), "abcd");

        // One byte over: truncated and flagged
        let result = truncate_result(text_result("abcde"), 4);
        assert_eq!(result.content.len(), 2);
        assert!(result.text_content().starts_with("abcd\n(truncated"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let result = truncate_result(text_result("aé"), 2);
        // 'é' is two bytes starting at offset 1; the cut backs up to 1
        assert!(result.text_content().starts_with("a\n(truncated"));
    }

    #[test]
    fn test_session_state_names() {
        assert_eq!(SessionState::Ready.as_str(), "ready");
        assert_eq!(SessionState::Authenticating.as_str(), "authenticating");
    }

    #[tokio::test]
    async fn test_initial_status() {
        let session = UpstreamSession::new(
            ServerConfig::stdio("fs", "echo-mcp"),
            20_000,
            None,
            None,
        )
        .unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Created);
        assert!(!status.connected);
        assert_eq!(status.tool_count, 0);
    }
}
