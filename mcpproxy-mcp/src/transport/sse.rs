//! Server-Sent Events client transport
//!
//! The classic MCP HTTP transport: a long-lived GET carries server-to-client
//! events, client-to-server messages are POSTed to the endpoint announced in
//! the initial `endpoint` event. Responses are correlated to requests by ID
//! through a pending map fed by the reader task.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::{build_http_client, streamable_http::validate_http_url, unauthorized_from_response, McpTransport};
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// How long a request waits for its correlated response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// SSE transport for remote MCP servers
pub struct SseTransport {
    /// Base SSE endpoint URL
    url: String,

    /// HTTP client with the configured default headers
    client: reqwest::Client,

    /// Bearer token installed by the OAuth subsystem
    bearer_token: parking_lot::RwLock<Option<String>>,

    /// POST endpoint announced by the server
    post_endpoint: Arc<parking_lot::RwLock<Option<String>>>,

    /// Responses waiting for correlation, keyed by request ID
    pending: PendingMap,

    /// Reader task pumping the event stream
    reader_task: Option<tokio::task::JoinHandle<()>>,

    /// Whether the transport is connected
    connected: Arc<AtomicBool>,
}

impl SseTransport {
    /// Create a new SSE transport
    pub fn new(url: String, headers: HashMap<String, String>) -> McpResult<Self> {
        validate_http_url(&url)?;
        let client = build_http_client(&headers, None)?;

        Ok(Self {
            url,
            client,
            bearer_token: parking_lot::RwLock::new(None),
            post_endpoint: Arc::new(parking_lot::RwLock::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader_task: None,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn id_key(id: &serde_json::Value) -> String {
        match id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Pump the event stream, resolving pending requests
    async fn run_reader(
        mut stream: impl futures_util::Stream<Item = reqwest::Result<Vec<u8>>> + Unpin,
        base_url: String,
        post_endpoint: Arc<parking_lot::RwLock<Option<String>>>,
        pending: PendingMap,
        connected: Arc<AtomicBool>,
    ) {
        let mut buffer = String::new();
        let mut event_name = String::new();

        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..pos + 2).collect();
                for line in frame.lines() {
                    if let Some(name) = line.strip_prefix("event:") {
                        event_name = name.trim().to_string();
                    } else if let Some(data) = line.strip_prefix("data:") {
                        let data = data.trim();
                        match event_name.as_str() {
                            // The server announces where to POST messages
                            "endpoint" => {
                                let endpoint = if data.starts_with("http") {
                                    data.to_string()
                                } else {
                                    join_endpoint(&base_url, data)
                                };
                                *post_endpoint.write() = Some(endpoint);
                            }
                            _ => {
                                if let Ok(response) =
                                    serde_json::from_str::<JsonRpcResponse>(data)
                                {
                                    if let Some(id) = &response.id {
                                        let key = Self::id_key(id);
                                        if let Some(tx) = pending.lock().remove(&key) {
                                            let _ = tx.send(response);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                event_name.clear();
            }
        }

        connected.store(false, Ordering::SeqCst);
        // Wake up anything still waiting; the stream is gone
        pending.lock().clear();
    }

    fn apply_auth(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = self.bearer_token.read().as_ref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn join_endpoint(base: &str, path: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(path)) {
        Ok(joined) => joined.to_string(),
        Err(_) => format!("{}{}", base.trim_end_matches('/'), path),
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&mut self) -> McpResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let builder = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let response = self
            .apply_auth(builder)
            .send()
            .await
            .map_err(|e| McpError::ConnectionFailed {
                message: format!("SSE connect failed: {}", e),
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(unauthorized_from_response(&response));
        }
        if !response.status().is_success() {
            return Err(McpError::ConnectionFailed {
                message: format!("SSE endpoint returned HTTP {}", response.status()),
            });
        }

        let stream = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()));
        let task = tokio::spawn(Self::run_reader(
            Box::pin(stream),
            self.url.clone(),
            self.post_endpoint.clone(),
            self.pending.clone(),
            self.connected.clone(),
        ));
        self.reader_task = Some(task);
        self.connected.store(true, Ordering::SeqCst);

        // Wait briefly for the endpoint announcement
        for _ in 0..50 {
            if self.post_endpoint.read().is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(McpError::ConnectionFailed {
            message: "SSE server did not announce a POST endpoint".to_string(),
        })
    }

    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("Transport not connected"));
        }

        let id = request
            .id
            .as_ref()
            .ok_or_else(|| McpError::transport("Request requires an id"))?;
        let key = Self::id_key(id);

        let endpoint = self
            .post_endpoint
            .read()
            .clone()
            .ok_or_else(|| McpError::transport("No POST endpoint announced"))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);

        let builder = self.client.post(&endpoint).json(&request);
        let send_result = self.apply_auth(builder).send().await;

        match send_result {
            Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
                self.pending.lock().remove(&key);
                return Err(unauthorized_from_response(&response));
            }
            Ok(response) if !response.status().is_success() => {
                self.pending.lock().remove(&key);
                return Err(McpError::transport(format!(
                    "POST returned HTTP {}",
                    response.status()
                )));
            }
            Ok(_) => {}
            Err(e) => {
                self.pending.lock().remove(&key);
                return Err(McpError::transport(format!("POST failed: {}", e)));
            }
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::transport("Event stream closed while waiting")),
            Err(_) => {
                self.pending.lock().remove(&key);
                Err(McpError::ServerTimeout {
                    timeout: RESPONSE_TIMEOUT,
                })
            }
        }
    }

    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
        let endpoint = self
            .post_endpoint
            .read()
            .clone()
            .ok_or_else(|| McpError::transport("No POST endpoint announced"))?;

        let builder = self.client.post(&endpoint).json(&notification);
        self.apply_auth(builder)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("POST failed: {}", e)))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write() = token;
    }

    async fn close(&mut self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.pending.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_endpoint() {
        assert_eq!(
            join_endpoint("https://example.com/sse", "/messages?id=1"),
            "https://example.com/messages?id=1"
        );
        assert_eq!(
            join_endpoint("https://example.com/mcp/sse", "messages"),
            "https://example.com/mcp/messages"
        );
    }

    #[test]
    fn test_id_key_for_string_and_number() {
        assert_eq!(SseTransport::id_key(&serde_json::json!("abc")), "abc");
        assert_eq!(SseTransport::id_key(&serde_json::json!(7)), "7");
    }
}
