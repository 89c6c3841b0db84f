//! MCP protocol implementation and upstream session management for MCPProxy
//!
//! This crate owns everything between the proxy core and its upstream MCP
//! servers: the JSON-RPC 2.0 / MCP message types, the three client transports
//! (stdio subprocess, SSE, streamable HTTP), the per-upstream session state
//! machine with reconnection, and the manager that supervises the whole fleet.

pub mod error;
pub mod manager;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use error::{McpError, McpResult};
pub use manager::{UpstreamEvent, UpstreamManager, UpstreamStatus};
pub use protocol::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, Tool, ToolAnnotations,
    ToolCallResult, ToolContent,
};
pub use reconnect::ReconnectPolicy;
pub use session::{
    truncate_result, BearerTokenProvider, SessionState, SessionStatus, StderrSink, UpstreamSession,
};
pub use transport::{McpTransport, TransportFactory};

/// MCP protocol version sent during the client handshake
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Default timeout for upstream operations
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
