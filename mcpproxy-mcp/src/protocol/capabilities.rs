//! MCP capability negotiation types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Capabilities advertised by the proxy when connecting upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Root directory support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,

    /// Sampling support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,

    /// Experimental capabilities
    #[serde(flatten)]
    pub experimental: HashMap<String, Value>,
}

/// Roots capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootsCapability {
    /// Whether list change notifications are supported
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capabilities advertised by an upstream server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    /// Resource support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,

    /// Prompt support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,

    /// Logging support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,

    /// Experimental capabilities
    #[serde(flatten)]
    pub experimental: HashMap<String, Value>,
}

/// Tools capability flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether the server emits tools/list_changed notifications
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

impl ServerCapabilities {
    /// Whether the upstream advertises tools at all
    pub fn supports_tools(&self) -> bool {
        self.tools.is_some()
    }
}
