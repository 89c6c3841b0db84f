//! Secret reference resolution
//!
//! Config values may be written as `${keyring:NAME}` or `${env:VAR}` instead
//! of literal secrets. Resolution happens once at load time; the rest of the
//! system only ever sees resolved values.

use crate::error::{ConfigError, ConfigResult};
use crate::domains::ProxyConfig;

/// Named secret storage
///
/// The default implementation delegates to the OS keyring; tests substitute
/// an in-memory map.
pub trait CredentialStore: Send + Sync {
    /// Fetch a secret by name
    fn get(&self, name: &str) -> ConfigResult<String>;

    /// Store a secret under a name
    fn set(&self, name: &str, value: &str) -> ConfigResult<()>;

    /// Delete a stored secret
    fn delete(&self, name: &str) -> ConfigResult<()>;
}

/// Service name under which secrets are filed in the OS keyring
const KEYRING_SERVICE: &str = "mcpproxy";

/// OS keyring backed credential store
pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    fn entry(name: &str) -> ConfigResult<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, name).map_err(|e| ConfigError::SecretError {
            reference: name.to_string(),
            message: e.to_string(),
        })
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, name: &str) -> ConfigResult<String> {
        Self::entry(name)?
            .get_password()
            .map_err(|e| ConfigError::SecretError {
                reference: name.to_string(),
                message: e.to_string(),
            })
    }

    fn set(&self, name: &str, value: &str) -> ConfigResult<()> {
        Self::entry(name)?
            .set_password(value)
            .map_err(|e| ConfigError::SecretError {
                reference: name.to_string(),
                message: e.to_string(),
            })
    }

    fn delete(&self, name: &str) -> ConfigResult<()> {
        Self::entry(name)?
            .delete_credential()
            .map_err(|e| ConfigError::SecretError {
                reference: name.to_string(),
                message: e.to_string(),
            })
    }
}

/// Credential store reading process environment variables
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get(&self, name: &str) -> ConfigResult<String> {
        std::env::var(name).map_err(|_| ConfigError::SecretError {
            reference: name.to_string(),
            message: "environment variable not set".to_string(),
        })
    }

    fn set(&self, _name: &str, _value: &str) -> ConfigResult<()> {
        Err(ConfigError::EnvError(
            "environment variables are read-only".to_string(),
        ))
    }

    fn delete(&self, _name: &str) -> ConfigResult<()> {
        Err(ConfigError::EnvError(
            "environment variables are read-only".to_string(),
        ))
    }
}

/// Resolves `${keyring:X}` and `${env:Y}` references in config values
pub struct SecretResolver {
    keyring: Box<dyn CredentialStore>,
    env: Box<dyn CredentialStore>,
}

impl SecretResolver {
    /// Resolver backed by the OS keyring and the process environment
    pub fn new() -> Self {
        Self {
            keyring: Box::new(KeyringCredentialStore),
            env: Box::new(EnvCredentialStore),
        }
    }

    /// Resolver with a custom keyring backend (used by tests)
    pub fn with_stores(keyring: Box<dyn CredentialStore>, env: Box<dyn CredentialStore>) -> Self {
        Self { keyring, env }
    }

    /// Resolve one value; non-reference values pass through unchanged
    pub fn resolve_value(&self, value: &str) -> ConfigResult<String> {
        let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
            return Ok(value.to_string());
        };

        match inner.split_once(':') {
            Some(("keyring", name)) => self.keyring.get(name),
            Some(("env", name)) => self.env.get(name),
            _ => Err(ConfigError::SecretError {
                reference: value.to_string(),
                message: "expected ${keyring:NAME} or ${env:VAR}".to_string(),
            }),
        }
    }

    /// Resolve every secret-bearing field of the configuration in place
    pub fn resolve_config(&self, config: &mut ProxyConfig) -> ConfigResult<()> {
        if let Some(api_key) = config.api_key.take() {
            config.api_key = Some(self.resolve_value(&api_key)?);
        }

        for server in &mut config.mcp_servers {
            for value in server.headers.values_mut() {
                *value = self.resolve_value(value)?;
            }
            for value in server.env.values_mut() {
                *value = self.resolve_value(value)?;
            }
            if let Some(oauth) = &mut server.oauth {
                if let Some(secret) = oauth.client_secret.take() {
                    oauth.client_secret = Some(self.resolve_value(&secret)?);
                }
            }
        }

        Ok(())
    }
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapStore(Mutex<HashMap<String, String>>);

    impl MapStore {
        fn with(pairs: &[(&str, &str)]) -> Self {
            Self(Mutex::new(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ))
        }
    }

    impl CredentialStore for MapStore {
        fn get(&self, name: &str) -> ConfigResult<String> {
            self.0
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::SecretError {
                    reference: name.to_string(),
                    message: "not found".to_string(),
                })
        }

        fn set(&self, name: &str, value: &str) -> ConfigResult<()> {
            self.0.lock().unwrap().insert(name.to_string(), value.to_string());
            Ok(())
        }

        fn delete(&self, name: &str) -> ConfigResult<()> {
            self.0.lock().unwrap().remove(name);
            Ok(())
        }
    }

    fn resolver() -> SecretResolver {
        SecretResolver::with_stores(
            Box::new(MapStore::with(&[("GITHUB_PAT", "ghp_secret")])),
            Box::new(MapStore::with(&[("MY_VAR", "from-env")])),
        )
    }

    #[test]
    fn test_plain_values_pass_through() {
        assert_eq!(resolver().resolve_value("plain").unwrap(), "plain");
    }

    #[test]
    fn test_keyring_reference_resolves() {
        assert_eq!(
            resolver().resolve_value("${keyring:GITHUB_PAT}").unwrap(),
            "ghp_secret"
        );
    }

    #[test]
    fn test_env_reference_resolves() {
        assert_eq!(resolver().resolve_value("${env:MY_VAR}").unwrap(), "from-env");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(resolver().resolve_value("${vault:X}").is_err());
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        assert!(resolver().resolve_value("${keyring:NOPE}").is_err());
    }

    #[test]
    fn test_config_header_resolution() {
        use crate::domains::upstream::ServerConfig;

        let mut cfg = ProxyConfig::default();
        let mut server = ServerConfig::http("gh", "https://example.com/mcp");
        server
            .headers
            .insert("Authorization".into(), "${keyring:GITHUB_PAT}".into());
        cfg.mcp_servers.push(server);

        resolver().resolve_config(&mut cfg).unwrap();
        assert_eq!(
            cfg.mcp_servers[0].headers.get("Authorization").unwrap(),
            "ghp_secret"
        );
    }
}
