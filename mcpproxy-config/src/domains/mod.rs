//! Domain-specific configuration modules

pub mod logging;
pub mod security;
pub mod tokenizer;
pub mod upstream;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::ConfigResult;
use crate::validation::{validate_listen_addr, Validatable};

/// Main MCPProxy configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// TCP listen address
    pub listen: String,

    /// Data directory (config.db, index, logs, IPC socket)
    pub data_dir: PathBuf,

    /// API key required on the TCP listener (may be a secret reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Local IPC endpoint, e.g. `unix:///path/mcpproxy.sock`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tray_endpoint: Option<String>,

    /// Default result count for `retrieve_tools`
    pub top_k: usize,

    /// Maximum tools advertised to a client in one `tools/list`
    pub tools_limit: usize,

    /// Default tool response size cap in bytes
    pub tool_response_limit: usize,

    /// Whether `search_servers` consults the public registry list
    pub check_server_repo: bool,

    /// Upstream MCP servers
    #[serde(rename = "mcpServers")]
    pub mcp_servers: Vec<upstream::ServerConfig>,

    /// Data-flow security configuration
    pub security: security::SecurityConfig,

    /// Tokenizer configuration
    pub tokenizer: tokenizer::TokenizerConfig,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

/// Default data directory: `~/.mcpproxy`, falling back to the working dir
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".mcpproxy"),
        None => PathBuf::from(".mcpproxy"),
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            data_dir: default_data_dir(),
            api_key: None,
            tray_endpoint: None,
            top_k: 5,
            tools_limit: 15,
            tool_response_limit: 20_000,
            check_server_repo: true,
            mcp_servers: Vec::new(),
            security: security::SecurityConfig::default(),
            tokenizer: tokenizer::TokenizerConfig::default(),
            logging: logging::LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.validate()?;
        self.security.validate()?;

        let mut seen = HashSet::new();
        for server in &self.mcp_servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(self.validation_error(format!(
                    "duplicate upstream server name '{}'",
                    server.name
                )));
            }
        }

        Ok(())
    }

    /// Look up an upstream server config by name
    pub fn server(&self, name: &str) -> Option<&upstream::ServerConfig> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }

    /// Default path of the local IPC socket under the data directory
    pub fn default_socket_path(&self) -> PathBuf {
        self.data_dir.join("mcpproxy.sock")
    }
}

impl Validatable for ProxyConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_listen_addr(&self.listen, "listen", self.domain_name())?;

        if self.data_dir.as_os_str().is_empty() {
            return Err(self.validation_error("data_dir cannot be empty"));
        }
        if self.tool_response_limit == 0 {
            return Err(self.validation_error("tool_response_limit must be greater than 0"));
        }
        if let Some(endpoint) = &self.tray_endpoint {
            if !endpoint.starts_with("unix://") && !endpoint.starts_with("npipe://") {
                return Err(self.validation_error(format!(
                    "tray_endpoint '{}' must use the unix:// or npipe:// scheme",
                    endpoint
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "proxy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProxyConfig::default().validate_all().is_ok());
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let mut cfg = ProxyConfig::default();
        cfg.mcp_servers.push(upstream::ServerConfig::stdio("fs", "echo-mcp"));
        cfg.mcp_servers.push(upstream::ServerConfig::stdio("fs", "other-mcp"));
        assert!(cfg.validate_all().is_err());
    }

    #[test]
    fn test_mcp_servers_key_name() {
        let json = serde_json::json!({
            "listen": "127.0.0.1:9000",
            "mcpServers": [{"name": "fs", "protocol": "stdio", "command": "echo-mcp"}]
        });
        let cfg: ProxyConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.mcp_servers.len(), 1);
        assert!(cfg.mcp_servers[0].enabled);
    }

    #[test]
    fn test_bad_tray_endpoint_rejected() {
        let cfg = ProxyConfig {
            tray_endpoint: Some("tcp://1.2.3.4:1".into()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
