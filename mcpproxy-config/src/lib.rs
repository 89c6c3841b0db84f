//! Domain-driven configuration management for MCPProxy
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, environment variable support, and resolution
//! of `${keyring:NAME}` / `${env:VAR}` secret references.

pub mod error;
pub mod loader;
pub mod secrets;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use secrets::{CredentialStore, EnvCredentialStore, KeyringCredentialStore, SecretResolver};

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    security::{
        ClassificationConfig, FlowPolicyConfig, FlowTrackingConfig, HooksConfig, PolicyAction,
        SecurityConfig, ServerClass,
    },
    tokenizer::TokenizerConfig,
    upstream::{OAuthOverrides, ServerConfig, UpstreamProtocol},
    ProxyConfig,
};
