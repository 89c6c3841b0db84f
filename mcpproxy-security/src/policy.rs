//! Policy engine
//!
//! Maps a set of flow edges onto an allow/warn/ask/deny decision using the
//! configured rules, evaluated in severity order. Per-tool overrides take
//! precedence over everything. In proxy-only coverage an `ask` degrades to
//! `warn` because there is no user-confirmation channel.

use serde::{Deserialize, Serialize};

use crate::flow::{FlowDirection, FlowEdge, RiskLevel};
use mcpproxy_config::{FlowPolicyConfig, PolicyAction};

/// Security coverage mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    /// Only proxied tools are visible; no user-confirmation channel
    ProxyOnly,
    /// Agent hooks installed; agent-internal tools visible, `ask` available
    HookEnhanced,
}

impl CoverageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageMode::ProxyOnly => "proxy_only",
            CoverageMode::HookEnhanced => "hook_enhanced",
        }
    }
}

/// Decision produced for one outgoing call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: String,
    pub risk: RiskLevel,
    /// Set when coverage degradation changed the action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_from: Option<PolicyAction>,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Allow,
            reason: reason.into(),
            risk: RiskLevel::None,
            degraded_from: None,
        }
    }

    /// Whether the call may proceed to the upstream
    pub fn permits_call(&self) -> bool {
        matches!(self.action, PolicyAction::Allow | PolicyAction::Warn)
    }
}

/// Rule evaluator over flow edges
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: FlowPolicyConfig,
    mode: CoverageMode,
}

impl PolicyEngine {
    pub fn new(config: FlowPolicyConfig, mode: CoverageMode) -> Self {
        Self { config, mode }
    }

    pub fn mode(&self) -> CoverageMode {
        self.mode
    }

    pub fn config(&self) -> &FlowPolicyConfig {
        &self.config
    }

    /// Evaluate the rules for one outgoing call
    ///
    /// `dest_tool` is the namespaced (or agent-internal) tool name;
    /// `dest_urls` are any destination URLs found in the arguments.
    pub fn evaluate(
        &self,
        dest_tool: &str,
        dest_urls: &[String],
        edges: &[FlowEdge],
    ) -> PolicyDecision {
        // Per-tool override table wins outright
        if let Some(action) = self
            .config
            .tool_overrides
            .get(dest_tool)
            .or_else(|| {
                // Allow overriding by bare tool name as well
                dest_tool
                    .split_once(':')
                    .and_then(|(_, bare)| self.config.tool_overrides.get(bare))
            })
            .copied()
        {
            return self.degrade(PolicyDecision {
                action,
                reason: format!("tool override for '{}'", dest_tool),
                risk: edges.iter().map(|e| e.risk).max().unwrap_or(RiskLevel::None),
                degraded_from: None,
            });
        }

        // Rule 1: suspicious destination endpoints are always denied
        for url in dest_urls {
            if let Some(pattern) = self
                .config
                .suspicious_endpoints
                .iter()
                .find(|p| url.contains(p.as_str()))
            {
                return PolicyDecision {
                    action: PolicyAction::Deny,
                    reason: format!("destination matches suspicious endpoint '{}'", pattern),
                    risk: RiskLevel::Critical,
                    degraded_from: None,
                };
            }
        }

        // Rule 2: sensitive data flowing internal→external
        if let Some(edge) = edges.iter().find(|e| {
            e.direction == FlowDirection::InternalToExternal && !e.sensitive.is_empty()
        }) {
            let kinds: Vec<&str> = edge.sensitive.iter().map(|m| m.kind.as_str()).collect();
            return self.degrade(PolicyDecision {
                action: self.config.sensitive_data_external,
                reason: format!(
                    "sensitive data ({}) from {}:{} would flow {} to {}",
                    kinds.join(", "),
                    edge.source_server,
                    edge.source_tool,
                    edge.direction.as_str(),
                    edge.dest_server,
                ),
                risk: RiskLevel::Critical,
                degraded_from: None,
            });
        }

        // Rule 3: any internal→external flow
        if let Some(edge) = edges
            .iter()
            .find(|e| e.direction == FlowDirection::InternalToExternal)
        {
            return self.degrade(PolicyDecision {
                action: self.config.internal_to_external,
                reason: format!(
                    "data from {}:{} would flow {} to {}",
                    edge.source_server,
                    edge.source_tool,
                    edge.direction.as_str(),
                    edge.dest_server,
                ),
                risk: RiskLevel::Medium,
                degraded_from: None,
            });
        }

        PolicyDecision::allow("no risky flow detected")
    }

    /// Coverage degradation: `ask` without a confirmation channel is `warn`
    fn degrade(&self, mut decision: PolicyDecision) -> PolicyDecision {
        if self.mode == CoverageMode::ProxyOnly && decision.action == PolicyAction::Ask {
            decision.degraded_from = Some(PolicyAction::Ask);
            decision.action = PolicyAction::Warn;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitive::SensitiveMarker;
    use chrono::Utc;

    fn edge(direction: FlowDirection, sensitive: bool) -> FlowEdge {
        FlowEdge {
            hash: "aa".repeat(16),
            source_server: "github".into(),
            source_tool: "get_file".into(),
            dest_server: "slack".into(),
            dest_tool: "post_message".into(),
            direction,
            risk: RiskLevel::Medium,
            sensitive: if sensitive {
                vec![SensitiveMarker {
                    kind: "openai_api_key".into(),
                }]
            } else {
                Vec::new()
            },
            timestamp: Utc::now(),
        }
    }

    fn engine(mode: CoverageMode) -> PolicyEngine {
        PolicyEngine::new(FlowPolicyConfig::default(), mode)
    }

    #[test]
    fn test_sensitive_external_flow_is_denied() {
        let decision = engine(CoverageMode::HookEnhanced).evaluate(
            "slack:post_message",
            &[],
            &[edge(FlowDirection::InternalToExternal, true)],
        );
        assert_eq!(decision.action, PolicyAction::Deny);
        assert_eq!(decision.risk, RiskLevel::Critical);
        assert!(decision.reason.contains("sensitive"));
        assert!(decision.reason.contains("internal→external"));
        assert!(!decision.permits_call());
    }

    #[test]
    fn test_plain_external_flow_asks_in_hook_mode() {
        let decision = engine(CoverageMode::HookEnhanced).evaluate(
            "slack:post_message",
            &[],
            &[edge(FlowDirection::InternalToExternal, false)],
        );
        assert_eq!(decision.action, PolicyAction::Ask);
        assert!(decision.degraded_from.is_none());
    }

    #[test]
    fn test_ask_degrades_to_warn_in_proxy_only() {
        let decision = engine(CoverageMode::ProxyOnly).evaluate(
            "slack:post_message",
            &[],
            &[edge(FlowDirection::InternalToExternal, false)],
        );
        assert_eq!(decision.action, PolicyAction::Warn);
        assert_eq!(decision.degraded_from, Some(PolicyAction::Ask));
        assert!(decision.permits_call());
    }

    #[test]
    fn test_suspicious_endpoint_always_denies() {
        let mut config = FlowPolicyConfig::default();
        config.suspicious_endpoints.push("pastebin.com".into());
        let engine = PolicyEngine::new(config, CoverageMode::ProxyOnly);

        let decision = engine.evaluate(
            "web:post",
            &["https://pastebin.com/upload".into()],
            &[],
        );
        assert_eq!(decision.action, PolicyAction::Deny);
    }

    #[test]
    fn test_tool_override_forces_allow() {
        let mut config = FlowPolicyConfig::default();
        config
            .tool_overrides
            .insert("WebSearch".into(), PolicyAction::Allow);
        let engine = PolicyEngine::new(config, CoverageMode::HookEnhanced);

        let decision = engine.evaluate(
            "WebSearch",
            &[],
            &[edge(FlowDirection::InternalToExternal, true)],
        );
        assert_eq!(decision.action, PolicyAction::Allow);
    }

    #[test]
    fn test_no_edges_allows() {
        let decision = engine(CoverageMode::HookEnhanced).evaluate("fs:read_file", &[], &[]);
        assert_eq!(decision.action, PolicyAction::Allow);
        assert!(decision.permits_call());
    }
}
