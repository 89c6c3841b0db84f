//! Standard I/O transport for local MCP server subprocesses

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::McpTransport;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::session::StderrSink;

struct Pipes {
    writer: BufWriter<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

/// Stdio transport speaking line-framed JSON-RPC with a child process
///
/// The pipe is serial: one request is in flight at a time, enforced by the
/// mutex around both pipe halves.
pub struct StdioTransport {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Environment variables
    env: HashMap<String, String>,

    /// Working directory
    cwd: Option<String>,

    /// Child process handle
    child: Mutex<Option<Child>>,

    /// Stdin writer + stdout reader, taken together per request
    pipes: Mutex<Option<Pipes>>,

    /// Receives stderr lines from the subprocess
    stderr_sink: Option<StderrSink>,

    /// Stderr forwarder task
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// Whether the transport is connected
    connected: AtomicBool,
}

impl StdioTransport {
    /// Create a new stdio transport
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
        stderr_sink: Option<StderrSink>,
    ) -> McpResult<Self> {
        if command.trim().is_empty() {
            return Err(McpError::Configuration {
                message: "Command cannot be empty".to_string(),
            });
        }

        Ok(Self {
            command,
            args,
            env,
            cwd,
            child: Mutex::new(None),
            pipes: Mutex::new(None),
            stderr_sink,
            stderr_task: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    /// Spawn the child process and wire up its pipes
    async fn spawn_process(&self) -> McpResult<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.env)
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            message: format!("Failed to spawn process '{}': {}", self.command, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::transport("Failed to get stdin handle"))?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::transport("Failed to get stdout handle"))?;
        let stderr = child.stderr.take().ok_or_else(|| McpError::transport("Failed to get stderr handle"))?;

        // Forward stderr lines into the per-server log ring
        if let Some(sink) = self.stderr_sink.clone() {
            let task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(line);
                }
            });
            *self.stderr_task.lock().await = Some(task);
        }

        *self.pipes.lock().await = Some(Pipes {
            writer: BufWriter::new(stdin),
            reader: BufReader::new(stdout),
        });
        *self.child.lock().await = Some(child);

        Ok(())
    }

    /// Check if the child process is still running
    async fn is_process_running(&self) -> bool {
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            child.try_wait().map_or(true, |status| status.is_none())
        } else {
            false
        }
    }

    async fn write_line(pipes: &mut Pipes, line: &str) -> McpResult<()> {
        pipes
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::transport(format!("Failed to write to stdin: {}", e)))?;
        pipes
            .writer
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::transport(format!("Failed to write newline: {}", e)))?;
        pipes
            .writer
            .flush()
            .await
            .map_err(|e| McpError::transport(format!("Failed to flush stdin: {}", e)))?;
        Ok(())
    }

    async fn read_line(pipes: &mut Pipes) -> McpResult<String> {
        let mut line = String::new();
        let bytes_read = pipes
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| McpError::transport(format!("Failed to read from stdout: {}", e)))?;

        if bytes_read == 0 {
            return Err(McpError::ConnectionFailed {
                message: "Process closed stdout".to_string(),
            });
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> McpResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.spawn_process().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("Transport not connected"));
        }
        if !self.is_process_running().await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(McpError::ConnectionFailed {
                message: "Child process has terminated".to_string(),
            });
        }

        let expected_id = request.id.clone();
        let json = serde_json::to_string(&request).map_err(McpError::serialization)?;

        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| McpError::transport("Transport not connected"))?;

        if let Err(e) = Self::write_line(pipes, &json).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // Skip notifications and unrelated frames until the matching response
        loop {
            let line = match Self::read_line(pipes).await {
                Ok(line) => line,
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(&line) {
                Ok(response) if response.id == expected_id => return Ok(response),
                Ok(response) => {
                    tracing::debug!(
                        id = ?response.id,
                        "Skipping out-of-band frame while waiting for response"
                    );
                }
                Err(_) => {
                    tracing::debug!(line = %line, "Skipping non-response frame from upstream");
                }
            }
        }
    }

    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
        let json = serde_json::to_string(&notification).map_err(McpError::serialization)?;

        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| McpError::transport("Transport not connected"))?;
        Self::write_line(pipes, &json).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> McpResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Close stdin to signal the process to exit
        if let Some(pipes) = self.pipes.lock().await.take() {
            let mut writer = pipes.writer;
            let _ = writer.shutdown().await;
        }

        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill child process: {}", e);
                    }
                    let _ = child.wait().await;
                }
                Err(e) => {
                    tracing::warn!("Error checking child process status: {}", e);
                }
            }
        }

        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Best effort cleanup; kill_on_drop covers the child itself
        if let Ok(mut child) = self.child.try_lock() {
            if let Some(child) = child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_command_rejected() {
        assert!(StdioTransport::new("".into(), vec![], HashMap::new(), None, None).is_err());
    }

    #[tokio::test]
    async fn test_request_round_trip_against_cat() {
        // cat echoes the request line back; the echoed request has the same
        // id as the expected response, so it parses as a matching frame.
        let mut transport =
            StdioTransport::new("cat".into(), vec![], HashMap::new(), None, None).unwrap();
        transport.connect().await.unwrap();

        let request = JsonRpcRequest::with_id("ping", Some(json!({})), "req-1");
        let response = transport.request(request).await;
        assert!(response.is_ok());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stderr_lines_reach_the_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: StderrSink = std::sync::Arc::new(move |line| {
            let _ = tx.send(line);
        });

        let mut transport = StdioTransport::new(
            "sh".into(),
            vec!["-c".into(), "echo oops >&2; cat".into()],
            HashMap::new(),
            None,
            Some(sink),
        )
        .unwrap();
        transport.connect().await.unwrap();

        let line = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("oops"));

        transport.close().await.unwrap();
    }
}
