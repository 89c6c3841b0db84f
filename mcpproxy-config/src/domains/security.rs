//! Data-flow security configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Security configuration combining flow tracking, classification and policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Cross-tool data-flow tracking
    pub flow_tracking: FlowTrackingConfig,

    /// Server/tool classification
    pub classification: ClassificationConfig,

    /// Flow policy decisions
    pub flow_policy: FlowPolicyConfig,

    /// Agent-hook integration
    pub hooks: HooksConfig,
}

impl Validatable for SecurityConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.flow_tracking.validate()?;
        self.flow_policy.validate()?;
        self.hooks.validate()?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "security"
    }
}

/// Flow tracking limits and session lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTrackingConfig {
    /// Whether flow tracking is active
    pub enabled: bool,

    /// Inactivity window after which a flow session is evicted
    pub session_timeout_minutes: u64,

    /// Maximum origin records kept per session (oldest evicted first)
    pub max_origins_per_session: usize,

    /// Minimum string length considered for content hashing
    pub hash_min_length: usize,

    /// Responses are truncated to this many bytes before hashing
    pub max_response_hash_bytes: usize,
}

impl Default for FlowTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_timeout_minutes: 30,
            max_origins_per_session: 10_000,
            hash_min_length: 20,
            max_response_hash_bytes: 64 * 1024,
        }
    }
}

impl Validatable for FlowTrackingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_origins_per_session == 0 {
            return Err(self.validation_error("max_origins_per_session must be greater than 0"));
        }
        if self.hash_min_length == 0 {
            return Err(self.validation_error("hash_min_length must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "security.flow_tracking"
    }
}

/// Trust class assigned to a server or tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerClass {
    /// Touches private data only (filesystem, internal databases)
    Internal,
    /// Can reach the outside world (web, mail, chat)
    External,
    /// Both reads private data and communicates externally
    Hybrid,
    /// Nothing known
    Unknown,
}

impl ServerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerClass::Internal => "internal",
            ServerClass::External => "external",
            ServerClass::Hybrid => "hybrid",
            ServerClass::Unknown => "unknown",
        }
    }
}

impl FromStr for ServerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(ServerClass::Internal),
            "external" => Ok(ServerClass::External),
            "hybrid" => Ok(ServerClass::Hybrid),
            "unknown" => Ok(ServerClass::Unknown),
            other => Err(format!("unknown server class: {}", other)),
        }
    }
}

/// Classification defaults and overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Class assigned when no rule matches
    pub default_unknown: ServerClass,

    /// Per-server class overrides, keyed by server name
    pub server_overrides: HashMap<String, ServerClass>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            default_unknown: ServerClass::Internal,
            server_overrides: HashMap::new(),
        }
    }
}

/// Action taken when a policy rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Warn,
    Ask,
    Deny,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Warn => "warn",
            PolicyAction::Ask => "ask",
            PolicyAction::Deny => "deny",
        }
    }
}

/// Flow policy rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowPolicyConfig {
    /// Action for internal-to-external flows without sensitive markers
    pub internal_to_external: PolicyAction,

    /// Action for internal-to-external flows carrying sensitive data
    pub sensitive_data_external: PolicyAction,

    /// Whether write/destructive calls must carry an intent reason
    pub require_justification: bool,

    /// Destination URL substrings that are always denied
    pub suspicious_endpoints: Vec<String>,

    /// Per-tool action overrides (namespaced or agent-internal tool name)
    pub tool_overrides: HashMap<String, PolicyAction>,
}

impl Default for FlowPolicyConfig {
    fn default() -> Self {
        Self {
            internal_to_external: PolicyAction::Ask,
            sensitive_data_external: PolicyAction::Deny,
            require_justification: true,
            suspicious_endpoints: Vec::new(),
            tool_overrides: HashMap::new(),
        }
    }
}

impl Validatable for FlowPolicyConfig {
    fn validate(&self) -> ConfigResult<()> {
        for endpoint in &self.suspicious_endpoints {
            if endpoint.trim().is_empty() {
                return Err(self.validation_error("suspicious_endpoints must not contain empty entries"));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "security.flow_policy"
    }
}

/// Agent-hook configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Whether the hook evaluate endpoint is served
    pub enabled: bool,

    /// On evaluator errors the hook CLI answers `allow`
    pub fail_open: bool,

    /// Lifetime of a pending hook/MCP correlation entry
    pub correlation_ttl_seconds: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
            correlation_ttl_seconds: 5,
        }
    }
}

impl Validatable for HooksConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.correlation_ttl_seconds == 0 {
            return Err(self.validation_error("correlation_ttl_seconds must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "security.hooks"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = SecurityConfig::default();
        assert!(cfg.flow_tracking.enabled);
        assert_eq!(cfg.flow_tracking.session_timeout_minutes, 30);
        assert_eq!(cfg.flow_tracking.max_origins_per_session, 10_000);
        assert_eq!(cfg.flow_tracking.hash_min_length, 20);
        assert_eq!(cfg.flow_tracking.max_response_hash_bytes, 65_536);
        assert_eq!(cfg.classification.default_unknown, ServerClass::Internal);
        assert_eq!(cfg.flow_policy.internal_to_external, PolicyAction::Ask);
        assert_eq!(cfg.flow_policy.sensitive_data_external, PolicyAction::Deny);
        assert_eq!(cfg.hooks.correlation_ttl_seconds, 5);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: SecurityConfig =
            serde_json::from_str(r#"{"flow_policy":{"internal_to_external":"deny"}}"#).unwrap();
        assert_eq!(cfg.flow_policy.internal_to_external, PolicyAction::Deny);
        assert_eq!(cfg.flow_policy.sensitive_data_external, PolicyAction::Deny);
        assert!(cfg.flow_tracking.enabled);
    }

    #[test]
    fn test_zero_origins_rejected() {
        let cfg = FlowTrackingConfig {
            max_origins_per_session: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
