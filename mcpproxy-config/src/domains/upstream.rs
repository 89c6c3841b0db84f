//! Upstream MCP server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, validate_url, Validatable};

/// Transport protocol used to reach an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    /// Local subprocess speaking line-framed JSON-RPC on stdin/stdout
    Stdio,
    /// Streamable HTTP: POST for requests, server push on a long-lived stream
    Http,
    /// Server-Sent Events for server->client, POST for client->server
    Sse,
}

impl UpstreamProtocol {
    /// Get the protocol name as used in API responses
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::Stdio => "stdio",
            UpstreamProtocol::Http => "http",
            UpstreamProtocol::Sse => "sse",
        }
    }
}

impl FromStr for UpstreamProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(UpstreamProtocol::Stdio),
            "http" | "streamable_http" => Ok(UpstreamProtocol::Http),
            "sse" => Ok(UpstreamProtocol::Sse),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Manual OAuth overrides for an upstream server
///
/// All fields are optional; anything not given here is discovered via
/// protected-resource metadata or dynamic client registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthOverrides {
    /// Pre-registered client ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Pre-registered client secret (may be a `${keyring:..}` reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Scopes to request
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    /// Extra query parameters appended to the authorization URL
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra_params: HashMap<String, String>,
}

/// Configuration for one upstream MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; doubles as the namespace prefix for its tools
    pub name: String,

    /// Transport protocol
    pub protocol: UpstreamProtocol,

    /// Endpoint URL (http / sse protocols)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Command to execute (stdio protocol)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables for the subprocess
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Working directory for the subprocess
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// HTTP headers sent with every request (values may be secret references)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Manual OAuth overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthOverrides>,

    /// Whether the server should be connected
    #[serde(default = "crate::domains::utils::default_true")]
    pub enabled: bool,

    /// Administrative quarantine flag; tools of quarantined servers are not callable
    #[serde(default = "crate::domains::utils::default_false")]
    pub quarantined: bool,

    /// Per-server override of the tool response size cap, in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response_limit: Option<usize>,
}

impl ServerConfig {
    /// Create a minimal stdio server config
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: UpstreamProtocol::Stdio,
            url: None,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            headers: HashMap::new(),
            oauth: None,
            enabled: true,
            quarantined: false,
            tool_response_limit: None,
        }
    }

    /// Create a minimal streamable-HTTP server config
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: UpstreamProtocol::Http,
            url: Some(url.into()),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            headers: HashMap::new(),
            oauth: None,
            enabled: true,
            quarantined: false,
            tool_response_limit: None,
        }
    }
}

impl Validatable for ServerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.name, "name", self.domain_name())?;

        if self.name.contains(':') {
            return Err(self.validation_error(format!(
                "name '{}' must not contain ':' (reserved as the tool namespace separator)",
                self.name
            )));
        }

        match self.protocol {
            UpstreamProtocol::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .ok_or_else(|| self.validation_error("stdio server requires a command"))?;
                validate_required_string(command, "command", self.domain_name())?;
            }
            UpstreamProtocol::Http | UpstreamProtocol::Sse => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| self.validation_error("http/sse server requires a url"))?;
                validate_url(url, "url", self.domain_name())?;
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "upstream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_server_requires_command() {
        let mut cfg = ServerConfig::stdio("fs", "echo-mcp");
        assert!(cfg.validate().is_ok());

        cfg.command = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_name_must_not_contain_namespace_separator() {
        let cfg = ServerConfig::stdio("a:b", "echo-mcp");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_http_server_requires_valid_url() {
        let mut cfg = ServerConfig::http("remote", "https://example.com/mcp");
        assert!(cfg.validate().is_ok());

        cfg.url = Some("not a url".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_server_config_round_trip() {
        let cfg = ServerConfig::http("remote", "https://example.com/mcp");
        let json = serde_json::to_value(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg, back);
    }
}
