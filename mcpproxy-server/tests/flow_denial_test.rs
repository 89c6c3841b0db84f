//! Flow-denial integration test
//!
//! A secret read from an internal server must not reach an external one:
//! the router blocks the call before any dispatch, appends exactly one
//! blocked policy_decision record, and the reason names the flow.

use std::sync::Arc;

use mcpproxy_config::{ProxyConfig, ServerConfig};
use mcpproxy_security::{classify, scan_sensitive, CoverageMode, PolicyEngine};
use mcpproxy_server::router::{Intent, IntentDeclaration, RouterError};
use mcpproxy_server::ServiceContainer;
use mcpproxy_storage::{ActivityFilter, ActivityStatus, ActivityType};

const SECRET: &str = "sk-proj-abc123def456ghi789jkl012mno345";

async fn services_with_slack() -> (Arc<ServiceContainer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        data_dir: dir.path().join("data"),
        ..Default::default()
    };
    let services = ServiceContainer::new(config).await.unwrap();

    // The destination server exists but is never dispatched to
    let mut slack = ServerConfig::http("slack", "https://slack.invalid/mcp");
    slack.enabled = false;
    services.manager.add(slack).await.unwrap();

    // Hook-enhanced coverage so `ask` is not degraded
    *services.policy.write() = PolicyEngine::new(
        services.config.read().security.flow_policy.clone(),
        CoverageMode::HookEnhanced,
    );

    (services, dir)
}

#[tokio::test]
async fn sensitive_internal_data_never_reaches_external_destination() {
    let (services, _dir) = services_with_slack().await;
    let session = "agent-session-1";

    // A prior read returned a body carrying an API key
    let body = format!("config file contents: api token {} (do not share)", SECRET);
    let classification = classify("github", "get_file", &services.config.read().security.classification);
    services.flow.record_response(
        session,
        "github",
        "get_file",
        &classification,
        &body,
        scan_sensitive(&body),
    );

    // The agent now tries to post that body to slack
    let args = serde_json::json!({ "channel": "#general", "text": body });
    let err = services
        .router
        .call_tool(&services, session, "slack:post_message", Some(args), None)
        .await
        .unwrap_err();

    let RouterError::PolicyBlocked { reason } = err else {
        panic!("expected a policy block, got: {:?}", err);
    };
    assert!(reason.contains("sensitive"), "reason: {}", reason);
    assert!(reason.contains("internal→external"), "reason: {}", reason);

    // Exactly one blocked policy_decision record
    let blocked = services
        .activity
        .query(&ActivityFilter {
            record_type: Some(ActivityType::PolicyDecision),
            status: Some(ActivityStatus::Blocked),
            session_id: Some(session.to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].tool.as_deref(), Some("slack:post_message"));
}

#[tokio::test]
async fn quarantined_server_refuses_calls() {
    let (services, _dir) = services_with_slack().await;
    services.manager.set_quarantine("slack", true).await.unwrap();

    let err = services
        .router
        .call_tool(
            &services,
            "agent-session-2",
            "slack:post_message",
            Some(serde_json::json!({"text": "hi"})),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Quarantined(_)));

    let blocked = services
        .activity
        .query(&ActivityFilter {
            status: Some(ActivityStatus::Blocked),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(blocked.len(), 1);
}

#[tokio::test]
async fn unknown_tool_names_are_rejected_and_recorded() {
    let (services, _dir) = services_with_slack().await;

    let err = services
        .router
        .call_tool(&services, "s", "not-namespaced", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTool(_)));

    let err = services
        .router
        .call_tool(&services, "s", "ghost:tool", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTool(_)));

    // Every refused call still lands in the activity log, exactly once
    let records = services
        .activity
        .query(&ActivityFilter {
            record_type: Some(ActivityType::ToolCall),
            status: Some(ActivityStatus::Error),
            session_id: Some("s".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.response.as_deref().unwrap_or("").contains("Unknown tool")));
}

#[tokio::test]
async fn declared_sensitivity_escalates_plain_flows() {
    let (services, _dir) = services_with_slack().await;
    let session = "agent-session-3";

    // A prior read returned a long but credential-free document
    let body = "quarterly board notes: revenue plans and hiring targets for next year";
    let classification =
        classify("fs", "read_file", &services.config.read().security.classification);
    services
        .flow
        .record_response(session, "fs", "read_file", &classification, body, vec![]);

    // The caller itself declares the data confidential; the sensitive rule
    // must fire even though the detector found nothing
    let declaration = IntentDeclaration {
        kind: Intent::Write,
        reason: Some("share notes".to_string()),
        data_sensitivity: Some("confidential".to_string()),
    };
    let args = serde_json::json!({ "channel": "#general", "text": body });
    let err = services
        .router
        .call_tool(&services, session, "slack:post_message", Some(args), Some(declaration))
        .await
        .unwrap_err();

    let RouterError::PolicyBlocked { reason } = err else {
        panic!("expected a policy block, got: {:?}", err);
    };
    assert!(reason.contains("sensitive"), "reason: {}", reason);
    assert!(reason.contains("declared_sensitivity"), "reason: {}", reason);
}
