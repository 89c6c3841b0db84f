//! Agent-hook evaluate path
//!
//! Agents with hooks installed call `POST /api/v1/hooks/evaluate` before and
//! after every tool use, giving the flow engine visibility into
//! agent-internal tools (hook-enhanced coverage). PreToolUse answers with a
//! decision; PostToolUse records origins and always allows. A short-TTL
//! correlation map binds hook sessions to the MCP calls they precede.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use mcpproxy_config::{HooksConfig, PolicyAction};
use mcpproxy_security::{classify, hash_content, scan_sensitive, TtlCache};
use mcpproxy_storage::{ActivityRecord, ActivityStatus, ActivityType};

use crate::services::ServiceContainer;

/// Hook evaluation request
#[derive(Debug, Clone, Deserialize)]
pub struct HookRequest {
    /// `PreToolUse` or `PostToolUse`
    pub event: String,

    /// Agent session identifier
    pub session_id: String,

    /// Tool name as the agent sees it (`Read`, `WebSearch`, `mcp__gh__get_file`)
    pub tool_name: String,

    /// Tool input payload
    #[serde(default)]
    pub tool_input: Value,

    /// Tool response payload (PostToolUse only)
    #[serde(default)]
    pub tool_response: Option<Value>,
}

/// Hook evaluation response
#[derive(Debug, Clone, Serialize)]
pub struct HookResponse {
    /// `allow`, `deny` or `ask`
    pub decision: String,

    pub reason: String,

    pub risk_level: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
}

impl HookResponse {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: "allow".into(),
            reason: reason.into(),
            risk_level: "none".into(),
            flow_type: None,
            activity_id: None,
        }
    }
}

/// Evaluator plus the pending correlation map
pub struct HookEvaluator {
    config: HooksConfig,
    /// `hash(tool_name || args)` → hook session ID
    correlations: TtlCache<String, String>,
}

impl HookEvaluator {
    pub fn new(config: HooksConfig) -> Self {
        let ttl = Duration::from_secs(config.correlation_ttl_seconds);
        Self {
            config,
            correlations: TtlCache::new(ttl, 1024),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn correlation_key(tool: &str, args: &Value) -> String {
        hash_content(format!("{}||{}", tool, args).as_bytes())
    }

    /// Look up and consume the hook session bound to an incoming MCP call
    ///
    /// A correlation answers exactly one call: a second identical call
    /// within the TTL gets its own session rather than the first one's.
    pub fn correlate_mcp_call(&self, tool: &str, args: &Value) -> Option<String> {
        let key = Self::correlation_key(tool, args);
        self.correlations.take(&key)
    }

    /// Parse a hook tool name into `(server, tool)`
    ///
    /// MCP tools arrive as `mcp__<server>__<tool>`; anything else is an
    /// agent-internal tool with no server.
    fn parse_tool(tool_name: &str) -> (String, String) {
        if let Some(rest) = tool_name.strip_prefix("mcp__") {
            if let Some((server, tool)) = rest.split_once("__") {
                return (server.to_string(), tool.to_string());
            }
        }
        (String::new(), tool_name.to_string())
    }

    /// Evaluate one hook event
    pub async fn evaluate(
        &self,
        services: &Arc<ServiceContainer>,
        request: &HookRequest,
    ) -> HookResponse {
        // A hook calling in proves hooks are installed
        services.mark_hooks_active();

        if !self.config.enabled {
            return HookResponse::allow("hooks disabled");
        }

        match request.event.as_str() {
            "PreToolUse" => self.evaluate_pre(services, request).await,
            "PostToolUse" => self.evaluate_post(services, request).await,
            other => HookResponse::allow(format!("unknown event '{}'", other)),
        }
    }

    async fn evaluate_pre(
        &self,
        services: &Arc<ServiceContainer>,
        request: &HookRequest,
    ) -> HookResponse {
        let (server, tool) = Self::parse_tool(&request.tool_name);

        // Bind the upcoming MCP call to this hook session
        if !server.is_empty() {
            self.correlations.put(
                Self::correlation_key(&tool, &request.tool_input),
                request.session_id.clone(),
            );
        }

        let classification = {
            let config = services.config.read();
            classify(&server, &tool, &config.security.classification)
        };
        let args_text = request.tool_input.to_string();
        let edges = services.flow.check_call(
            &request.session_id,
            &server,
            &tool,
            &classification,
            &args_text,
        );

        let dest_urls = extract_urls(&request.tool_input);
        let decision = services
            .policy
            .read()
            .evaluate(&request.tool_name, &dest_urls, &edges);

        let flow_type = edges.first().map(|e| e.direction.as_str().to_string());
        let blocked = decision.action == PolicyAction::Deny;

        let record = ActivityRecord::new(ActivityType::HookEvaluation)
            .with_tool(request.tool_name.clone())
            .with_session(request.session_id.clone())
            .with_status(if blocked {
                ActivityStatus::Blocked
            } else {
                ActivityStatus::Success
            })
            .with_metadata(json!({
                "event": "PreToolUse",
                "decision": decision.action.as_str(),
                "reason": decision.reason,
                "risk": decision.risk.as_str(),
                "flow_type": flow_type,
            }));
        let activity_id = services.activity.record(record);

        let wire_decision = match decision.action {
            PolicyAction::Deny => "deny",
            PolicyAction::Ask => "ask",
            PolicyAction::Allow | PolicyAction::Warn => "allow",
        };

        HookResponse {
            decision: wire_decision.into(),
            reason: decision.reason,
            risk_level: decision.risk.as_str().into(),
            flow_type,
            activity_id,
        }
    }

    async fn evaluate_post(
        &self,
        services: &Arc<ServiceContainer>,
        request: &HookRequest,
    ) -> HookResponse {
        let (server, tool) = Self::parse_tool(&request.tool_name);
        let Some(response) = &request.tool_response else {
            return HookResponse::allow("no response to record");
        };

        let classification = {
            let config = services.config.read();
            classify(&server, &tool, &config.security.classification)
        };

        // Origin recording happens off the reply path; PostToolUse always allows
        let flow = services.flow.clone();
        let session_id = request.session_id.clone();
        let body = response_text(response);
        let markers = scan_sensitive(&body);
        tokio::spawn(async move {
            flow.record_response(&session_id, &server, &tool, &classification, &body, markers);
        });

        HookResponse::allow("origin recorded")
    }
}

/// Flatten a hook tool response to the text the hasher sees
fn response_text(response: &Value) -> String {
    match response {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_urls(value: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    fn walk(value: &Value, urls: &mut Vec<String>) {
        match value {
            Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
                urls.push(s.clone())
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, urls)),
            Value::Object(map) => map.values().for_each(|v| walk(v, urls)),
            _ => {}
        }
    }
    walk(value, &mut urls);
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_names() {
        assert_eq!(
            HookEvaluator::parse_tool("mcp__github__get_file"),
            ("github".into(), "get_file".into())
        );
        assert_eq!(HookEvaluator::parse_tool("WebSearch"), ("".into(), "WebSearch".into()));
    }

    #[test]
    fn test_correlation_is_consumed_by_one_call() {
        let evaluator = HookEvaluator::new(HooksConfig::default());
        let args = json!({"path": "/tmp/x"});
        evaluator.correlations.put(
            HookEvaluator::correlation_key("get_file", &args),
            "sess-9".into(),
        );

        assert_eq!(
            evaluator.correlate_mcp_call("get_file", &args).as_deref(),
            Some("sess-9")
        );
        // The matching call consumed it; an identical follow-up call gets
        // its own session
        assert!(evaluator.correlate_mcp_call("get_file", &args).is_none());
        assert!(evaluator
            .correlate_mcp_call("get_file", &json!({"path": "/other"}))
            .is_none());
    }
}
