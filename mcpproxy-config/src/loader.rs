//! Configuration loading and environment variable handling

use std::path::Path;
use std::str::FromStr;

use crate::domains::ProxyConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::secrets::SecretResolver;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,

    /// Secret resolver applied after parsing
    resolver: SecretResolver,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "MCPPROXY".to_string(),
            resolver: SecretResolver::new(),
        }
    }

    /// Create a loader with a custom secret resolver (used by tests)
    pub fn with_resolver(resolver: SecretResolver) -> Self {
        Self {
            prefix: "MCPPROXY".to_string(),
            resolver,
        }
    }

    /// Load configuration from a JSON file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ProxyConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ProxyConfig = serde_json::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        self.resolver.resolve_config(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ProxyConfig> {
        let mut config = ProxyConfig::default();
        self.apply_env_overrides(&mut config)?;
        self.resolver.resolve_config(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ProxyConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Validate a raw JSON document without applying it
    pub fn validate_json(&self, content: &str) -> ConfigResult<ProxyConfig> {
        let config: ProxyConfig = serde_json::from_str(content)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ProxyConfig) -> ConfigResult<()> {
        if let Ok(listen) = self.get_env_var("LISTEN") {
            config.listen = listen;
        }

        if let Ok(data_dir) = self.get_env_var("DATA_DIR") {
            config.data_dir = data_dir.into();
        }

        if let Ok(api_key) = self.get_env_var("API_KEY") {
            config.api_key = Some(api_key);
        }

        if let Ok(endpoint) = self.get_env_var("TRAY_ENDPOINT") {
            config.tray_endpoint = Some(endpoint);
        }

        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(limit) = self.get_env_var("TOOL_RESPONSE_LIMIT") {
            config.tool_response_limit = limit.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid TOOL_RESPONSE_LIMIT: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get an environment variable with the configured prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen":"127.0.0.1:9091","mcpServers":[{{"name":"fs","protocol":"stdio","command":"echo-mcp"}}]}}"#
        )
        .unwrap();

        let config = ConfigLoader::new().from_file(file.path()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9091");
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.top_k, 5);
    }

    #[test]
    fn test_invalid_json_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let err = ConfigLoader::new().from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validate_json_rejects_bad_server() {
        let loader = ConfigLoader::new();
        let err = loader
            .validate_json(r#"{"mcpServers":[{"name":"","protocol":"stdio","command":"x"}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { .. }));
    }
}
