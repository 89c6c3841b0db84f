//! Request router and policy gate
//!
//! Every client tool call passes through one pipeline: namespace parsing,
//! quarantine, intent checks, sensitive-data scan, flow check, policy
//! decision, dispatch, origin recording, activity logging. Exactly one
//! activity record is appended per call that returns to the client,
//! including every refused call.

use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;

use mcpproxy_mcp::{McpError, SessionState, ToolCallResult};
use mcpproxy_security::{classify, scan_sensitive, PolicyDecision, SensitiveMarker};
use mcpproxy_storage::{ActivityRecord, ActivityStatus, ActivityType, TokenCounts};
use mcpproxy_web::events::channels;

use crate::activity::ActivityService;
use crate::services::ServiceContainer;

/// Deadline for one upstream dispatch
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-declared intent accompanying a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
    Destructive,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Read => "read",
            Intent::Write => "write",
            Intent::Destructive => "destructive",
        }
    }
}

/// Full intent declaration from the `call_tool_*` variants
#[derive(Debug, Clone, PartialEq)]
pub struct IntentDeclaration {
    /// Declared operation kind
    pub kind: Intent,

    /// Caller's justification (required for destructive calls)
    pub reason: Option<String>,

    /// Caller's assessment of the data involved; values like `secret` or
    /// `confidential` mark matching flows sensitive even when the detector
    /// finds no credential-shaped content
    pub data_sensitivity: Option<String>,
}

impl IntentDeclaration {
    pub fn new(kind: Intent) -> Self {
        Self {
            kind,
            reason: None,
            data_sensitivity: None,
        }
    }

    /// Whether the declared sensitivity escalates flows to sensitive
    fn declares_sensitive_data(&self) -> bool {
        self.data_sensitivity.as_deref().is_some_and(|s| {
            matches!(
                s.to_lowercase().as_str(),
                "secret" | "confidential" | "sensitive" | "high"
            )
        })
    }
}

/// Router failures, each mapping to a structured tool error for the client
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Unknown tool '{0}': tool names are namespaced as server:tool")]
    UnknownTool(String),

    #[error("Server '{0}' is quarantined; unquarantine it to run its tools")]
    Quarantined(String),

    #[error("Intent mismatch: {0}")]
    IntentMismatch(String),

    #[error("Blocked by policy: {reason}")]
    PolicyBlocked { reason: String },

    #[error("Server '{0}' is not connected")]
    NotReady(String),

    #[error(transparent)]
    Upstream(#[from] McpError),
}

/// Stateless router; all collaborators come from the service container
#[derive(Debug, Clone, Default)]
pub struct ToolRouter;

impl ToolRouter {
    pub fn new() -> Self {
        Self
    }

    /// Run the full tool-call pipeline
    pub async fn call_tool(
        &self,
        services: &ServiceContainer,
        session_id: &str,
        namespaced: &str,
        arguments: Option<Value>,
        intent: Option<IntentDeclaration>,
    ) -> Result<ToolCallResult, RouterError> {
        let started = Instant::now();
        let intent_kind = intent.as_ref().map(|i| i.kind);
        let intent_reason = intent.as_ref().and_then(|i| i.reason.as_deref());

        // 1. Namespace parse
        let Some((server, tool)) = namespaced.split_once(':') else {
            let err = RouterError::UnknownTool(namespaced.to_string());
            self.log_call_error(services, session_id, None, namespaced, &arguments, &err);
            return Err(err);
        };

        let Some(config) = services.manager.get_config(server).await else {
            let err = RouterError::UnknownTool(namespaced.to_string());
            self.log_call_error(services, session_id, Some(server), namespaced, &arguments, &err);
            return Err(err);
        };

        // 2. Quarantine gate
        if config.quarantined {
            self.log_blocked(
                &services.activity,
                session_id,
                server,
                namespaced,
                &arguments,
                "server is quarantined",
                None,
                None,
            );
            return Err(RouterError::Quarantined(server.to_string()));
        }

        // 3. Intent declaration checks
        if let Some(session) = services.manager.get(server).await {
            if intent_kind == Some(Intent::Read) {
                let destructive = session.tools().await.iter().any(|t| {
                    t.name == tool
                        && t.annotations
                            .as_ref()
                            .and_then(|a| a.destructive_hint)
                            .unwrap_or(false)
                });
                if destructive {
                    let err = RouterError::IntentMismatch(format!(
                        "tool '{}' is annotated destructive but was called with read intent",
                        namespaced
                    ));
                    self.log_intent_rejection(services, session_id, server, namespaced, &arguments, &err, &intent);
                    return Err(err);
                }
            }
        }
        let require_justification = {
            let config = services.config.read();
            config.security.flow_policy.require_justification
        };
        if require_justification
            && intent_kind == Some(Intent::Destructive)
            && intent_reason.map(str::trim).unwrap_or_default().is_empty()
        {
            let err = RouterError::IntentMismatch(
                "destructive calls require an intent_reason".to_string(),
            );
            self.log_intent_rejection(services, session_id, server, namespaced, &arguments, &err, &intent);
            return Err(err);
        }

        let args_text = arguments
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();

        // 4. Sensitive-data scan over the outgoing arguments
        let argument_markers = scan_sensitive(&args_text);

        // 5. Flow check
        let classification = {
            let config = services.config.read();
            classify(server, tool, &config.security.classification)
        };
        let mut edges =
            services
                .flow
                .check_call(session_id, server, tool, &classification, &args_text);

        // A declared sensitivity counts as a sensitive marker on every
        // matched flow, independent of what the detector saw
        if intent.as_ref().is_some_and(|i| i.declares_sensitive_data()) {
            for edge in &mut edges {
                edge.sensitive.push(SensitiveMarker {
                    kind: "declared_sensitivity".to_string(),
                });
            }
        }

        // 6. Policy decision
        let dest_urls = extract_urls(&arguments);
        let decision = services.policy.read().evaluate(namespaced, &dest_urls, &edges);

        if !edges.is_empty() || !decision.permits_call() {
            services.events.publish(
                channels::FLOW_ALERT,
                json!({
                    "session_id": session_id,
                    "tool": namespaced,
                    "decision": decision.action.as_str(),
                    "risk": decision.risk.as_str(),
                    "reason": decision.reason,
                }),
            );
        }

        let flow_type = edges.first().map(|e| e.direction.as_str());

        if !decision.permits_call() {
            self.log_blocked(
                &services.activity,
                session_id,
                server,
                namespaced,
                &arguments,
                &decision.reason,
                Some(&decision),
                flow_type,
            );
            return Err(RouterError::PolicyBlocked {
                reason: format!(
                    "{} ({})",
                    decision.reason,
                    decision.action.as_str()
                ),
            });
        }
        if decision.action == mcpproxy_config::PolicyAction::Warn {
            // Allowed, but the decision itself is worth a record
            let mut record = ActivityRecord::new(ActivityType::PolicyDecision)
                .with_server(server)
                .with_tool(namespaced)
                .with_session(session_id)
                .with_status(ActivityStatus::Success);
            record.metadata = Some(json!({
                "decision": decision.action.as_str(),
                "degraded_from": decision.degraded_from.map(|a| a.as_str()),
                "reason": decision.reason,
                "risk": decision.risk.as_str(),
                "flow_type": flow_type,
            }));
            services.activity.record(record);
        }

        // 7. Dispatch; declared-read calls hit the short-TTL response cache
        let cache_key = (intent_kind == Some(Intent::Read))
            .then(|| mcpproxy_security::hash_content(format!("{}|{}", namespaced, args_text).as_bytes()));
        if let Some(key) = &cache_key {
            if let Some(cached) = services.response_cache.get(key) {
                let mut record = ActivityRecord::new(ActivityType::ToolCall)
                    .with_server(server)
                    .with_tool(namespaced)
                    .with_session(session_id)
                    .with_status(ActivityStatus::Success);
                record.duration_ms = Some(started.elapsed().as_millis() as u64);
                record.request = Some(ActivityService::preview(&args_text));
                record.metadata = Some(json!({ "cached": true, "intent": "read" }));
                services.activity.record(record);
                return Ok(cached);
            }
        }

        let session = services.manager.get(server).await;
        let session = match session {
            Some(session) if session.status().state == SessionState::Ready => session,
            _ => {
                let err = RouterError::NotReady(server.to_string());
                self.log_call_error(services, session_id, Some(server), namespaced, &arguments, &err);
                return Err(err);
            }
        };

        let call_result = session.call_tool(tool, arguments.clone(), CALL_TIMEOUT).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match call_result {
            Ok(result) => {
                let response_text = result.text_content();

                if let Some(key) = cache_key {
                    if !result.is_error {
                        services.response_cache.put(key, result.clone());
                    }
                }

                // 8. Record origins off the hot path
                {
                    let flow = services.flow.clone();
                    let session_id = session_id.to_string();
                    let server = server.to_string();
                    let tool = tool.to_string();
                    let body = response_text.clone();
                    let mut markers = scan_sensitive(&body);
                    markers.extend(argument_markers);
                    markers.dedup();
                    tokio::spawn(async move {
                        flow.record_response(
                            &session_id,
                            &server,
                            &tool,
                            &classification,
                            &body,
                            markers,
                        );
                    });
                }

                let token_counts = services.tokens_counter.as_ref().and_then(|counter| {
                    Some(TokenCounts {
                        request: counter.count(&args_text)?,
                        response: counter.count(&response_text)?,
                    })
                });

                let mut record = ActivityRecord::new(ActivityType::ToolCall)
                    .with_server(server)
                    .with_tool(namespaced)
                    .with_session(session_id)
                    .with_status(if result.is_error {
                        ActivityStatus::Error
                    } else {
                        ActivityStatus::Success
                    });
                record.duration_ms = Some(duration_ms);
                record.request = Some(ActivityService::preview(&args_text));
                record.response = Some(ActivityService::preview(&response_text));
                record.token_counts = token_counts;
                if let Some(intent) = &intent {
                    record.metadata = Some(json!({
                        "intent": intent.kind.as_str(),
                        "intent_reason": intent.reason,
                        "intent_data_sensitivity": intent.data_sensitivity,
                    }));
                }
                services.activity.record(record);

                Ok(result)
            }
            Err(e) => {
                // 9. Upstream errors propagate faithfully, logged once
                let mut record = ActivityRecord::new(ActivityType::ToolCall)
                    .with_server(server)
                    .with_tool(namespaced)
                    .with_session(session_id)
                    .with_status(ActivityStatus::Error);
                record.duration_ms = Some(duration_ms);
                record.request = Some(ActivityService::preview(&args_text));
                record.response = Some(e.to_string());
                services.activity.record(record);

                Err(RouterError::Upstream(e))
            }
        }
    }

    /// One `tool_call`/error record for a call refused before dispatch
    fn log_call_error(
        &self,
        services: &ServiceContainer,
        session_id: &str,
        server: Option<&str>,
        namespaced: &str,
        arguments: &Option<Value>,
        error: &RouterError,
    ) {
        let mut record = ActivityRecord::new(ActivityType::ToolCall)
            .with_tool(namespaced)
            .with_session(session_id)
            .with_status(ActivityStatus::Error);
        if let Some(server) = server {
            record = record.with_server(server);
        }
        record.request = arguments
            .as_ref()
            .map(|v| ActivityService::preview(&v.to_string()));
        record.response = Some(error.to_string());
        services.activity.record(record);
    }

    /// One blocked `policy_decision` record for an intent-check rejection
    #[allow(clippy::too_many_arguments)]
    fn log_intent_rejection(
        &self,
        services: &ServiceContainer,
        session_id: &str,
        server: &str,
        namespaced: &str,
        arguments: &Option<Value>,
        error: &RouterError,
        intent: &Option<IntentDeclaration>,
    ) {
        let mut record = ActivityRecord::new(ActivityType::PolicyDecision)
            .with_server(server)
            .with_tool(namespaced)
            .with_session(session_id)
            .with_status(ActivityStatus::Blocked);
        record.request = arguments
            .as_ref()
            .map(|v| ActivityService::preview(&v.to_string()));
        record.metadata = Some(json!({
            "decision": "deny",
            "reason": error.to_string(),
            "intent": intent.as_ref().map(|i| i.kind.as_str()),
            "intent_reason": intent.as_ref().and_then(|i| i.reason.as_deref()),
            "intent_data_sensitivity": intent.as_ref().and_then(|i| i.data_sensitivity.as_deref()),
        }));
        services.activity.record(record);
    }

    #[allow(clippy::too_many_arguments)]
    fn log_blocked(
        &self,
        activity: &ActivityService,
        session_id: &str,
        server: &str,
        namespaced: &str,
        arguments: &Option<Value>,
        reason: &str,
        decision: Option<&PolicyDecision>,
        flow_type: Option<&str>,
    ) {
        let mut record = ActivityRecord::new(ActivityType::PolicyDecision)
            .with_server(server)
            .with_tool(namespaced)
            .with_session(session_id)
            .with_status(ActivityStatus::Blocked);
        record.request = arguments
            .as_ref()
            .map(|v| ActivityService::preview(&v.to_string()));
        record.metadata = Some(match decision {
            Some(decision) => json!({
                "decision": decision.action.as_str(),
                "reason": reason,
                "risk": decision.risk.as_str(),
                "flow_type": flow_type,
            }),
            None => json!({ "decision": "deny", "reason": reason }),
        });
        activity.record(record);
    }
}

/// Pull destination-looking URLs out of the argument values
fn extract_urls(arguments: &Option<Value>) -> Vec<String> {
    let mut urls = Vec::new();
    fn walk(value: &Value, urls: &mut Vec<String>) {
        match value {
            Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
                urls.push(s.clone());
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, urls)),
            Value::Object(map) => map.values().for_each(|v| walk(v, urls)),
            _ => {}
        }
    }
    if let Some(value) = arguments {
        walk(value, &mut urls);
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_urls_walks_nested_values() {
        let args = Some(json!({
            "url": "https://pastebin.com/x",
            "nested": {"more": ["http://example.com", 42]},
            "plain": "not a url"
        }));
        let urls = extract_urls(&args);
        assert_eq!(urls.len(), 2);
        assert!(urls.contains(&"https://pastebin.com/x".to_string()));
    }

    #[test]
    fn test_intent_strings() {
        assert_eq!(Intent::Read.as_str(), "read");
        assert_eq!(Intent::Destructive.as_str(), "destructive");
    }

    #[test]
    fn test_declared_sensitivity_values() {
        let mut declaration = IntentDeclaration::new(Intent::Write);
        assert!(!declaration.declares_sensitive_data());

        declaration.data_sensitivity = Some("Confidential".to_string());
        assert!(declaration.declares_sensitive_data());

        declaration.data_sensitivity = Some("public".to_string());
        assert!(!declaration.declares_sensitive_data());
    }
}
