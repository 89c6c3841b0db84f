//! MCP protocol implementation: JSON-RPC 2.0 plus MCP message types

pub mod capabilities;
pub mod jsonrpc;
pub mod messages;

pub use capabilities::{ClientCapabilities, ServerCapabilities, ToolsCapability};
pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse};
pub use messages::{
    ClientInfo, InitializeParams, InitializeResult, ServerInfo, Tool, ToolAnnotations,
    ToolCallParams, ToolCallResult, ToolContent, ToolsListResult,
};

use serde_json::Value;
use uuid::Uuid;

/// Generate a new request ID
pub fn generate_request_id() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

/// Method names used by the proxy when talking upstream
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}
