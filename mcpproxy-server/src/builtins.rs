//! Built-in tool surface
//!
//! Tools the proxy itself serves to MCP clients, always present regardless
//! of upstream state. The intent-declaring call variants use flat string
//! parameters (`intent_reason`, `intent_data_sensitivity`) because several
//! agent clients reject nested object parameters in tool schemas.

use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use mcpproxy_config::ServerConfig;
use mcpproxy_mcp::{Tool, ToolCallResult};
use mcpproxy_storage::{ActivityRecord, ActivityStatus, ActivityType};

use crate::registry;
use crate::router::{Intent, IntentDeclaration};
use crate::services::ServiceContainer;

/// Names of the built-in tools
pub const RETRIEVE_TOOLS: &str = "retrieve_tools";
pub const CALL_TOOL_READ: &str = "call_tool_read";
pub const CALL_TOOL_WRITE: &str = "call_tool_write";
pub const CALL_TOOL_DESTRUCTIVE: &str = "call_tool_destructive";
pub const UPSTREAM_SERVERS: &str = "upstream_servers";
pub const LIST_REGISTRIES: &str = "list_registries";
pub const SEARCH_SERVERS: &str = "search_servers";

/// Tool definitions advertised in `tools/list`
pub fn definitions() -> Vec<Tool> {
    let tool = |name: &str, description: &str, schema: Value| Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
        annotations: None,
    };

    vec![
        tool(
            RETRIEVE_TOOLS,
            "Search all connected upstream tools by intent. Returns the best-matching \
             namespaced tool names (server:tool) with scores and descriptions.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What you want to do"},
                    "limit": {"type": "integer", "description": "Maximum results (default 5, max 50)"}
                },
                "required": ["query"]
            }),
        ),
        tool(
            CALL_TOOL_READ,
            "Call an upstream tool that only reads data. Use retrieve_tools first to find the name.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Namespaced tool name (server:tool)"},
                    "arguments": {"type": "object", "description": "Tool arguments"}
                },
                "required": ["name"]
            }),
        ),
        tool(
            CALL_TOOL_WRITE,
            "Call an upstream tool that writes or modifies data.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Namespaced tool name (server:tool)"},
                    "arguments": {"type": "object", "description": "Tool arguments"},
                    "intent_reason": {"type": "string", "description": "Why this write is needed"}
                },
                "required": ["name"]
            }),
        ),
        tool(
            CALL_TOOL_DESTRUCTIVE,
            "Call an upstream tool that deletes or irreversibly changes data. Requires a justification.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Namespaced tool name (server:tool)"},
                    "arguments": {"type": "object", "description": "Tool arguments"},
                    "intent_reason": {"type": "string", "description": "Why this destructive call is needed"},
                    "intent_data_sensitivity": {"type": "string", "description": "Sensitivity of the data involved"}
                },
                "required": ["name", "intent_reason"]
            }),
        ),
        tool(
            UPSTREAM_SERVERS,
            "Manage upstream MCP servers: list, add, update, remove, enable, disable, restart, \
             quarantine, unquarantine.",
            json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["list", "add", "update", "remove", "enable", "disable",
                                 "restart", "quarantine", "unquarantine"]
                    },
                    "name": {"type": "string", "description": "Server name (all operations except list)"},
                    "config": {"type": "object", "description": "Server config (add/update)"}
                },
                "required": ["operation"]
            }),
        ),
        tool(
            LIST_REGISTRIES,
            "List the known public MCP server registries.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            SEARCH_SERVERS,
            "Search a public registry for installable MCP servers.",
            json!({
                "type": "object",
                "properties": {
                    "registry": {"type": "string", "description": "Registry name from list_registries"},
                    "query": {"type": "string", "description": "Search text"},
                    "limit": {"type": "integer", "description": "Maximum results (default 10)"}
                },
                "required": ["registry", "query"]
            }),
        ),
    ]
}

/// Whether a tool name is one of the built-ins
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        RETRIEVE_TOOLS
            | CALL_TOOL_READ
            | CALL_TOOL_WRITE
            | CALL_TOOL_DESTRUCTIVE
            | UPSTREAM_SERVERS
            | LIST_REGISTRIES
            | SEARCH_SERVERS
    )
}

/// Dispatch a built-in tool call
pub async fn dispatch(
    services: &Arc<ServiceContainer>,
    session_id: &str,
    name: &str,
    args: Value,
) -> ToolCallResult {
    match name {
        RETRIEVE_TOOLS => retrieve_tools(services, &args),
        CALL_TOOL_READ => call_variant(services, session_id, &args, Intent::Read).await,
        CALL_TOOL_WRITE => call_variant(services, session_id, &args, Intent::Write).await,
        CALL_TOOL_DESTRUCTIVE => {
            call_variant(services, session_id, &args, Intent::Destructive).await
        }
        UPSTREAM_SERVERS => upstream_servers(services, &args).await,
        LIST_REGISTRIES => {
            json_result(&json!({ "registries": registry::known_registries() }))
        }
        SEARCH_SERVERS => search_servers(services, &args).await,
        other => ToolCallResult::error(format!("unknown built-in tool '{}'", other)),
    }
}

fn json_result(value: &Value) -> ToolCallResult {
    match serde_json::to_string_pretty(value) {
        Ok(text) => ToolCallResult::text(text),
        Err(e) => ToolCallResult::error(format!("serialization failed: {}", e)),
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn retrieve_tools(services: &Arc<ServiceContainer>, args: &Value) -> ToolCallResult {
    let Some(query) = str_arg(args, "query") else {
        return ToolCallResult::error("retrieve_tools requires a 'query' parameter");
    };
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or_else(|| services.config.read().top_k);

    match services.index.query(query, limit) {
        Ok(hits) => {
            let total = hits.len();
            json_result(&json!({
                "tools": hits,
                "total": total,
            }))
        }
        Err(e) => ToolCallResult::error(format!("retrieval failed: {}", e)),
    }
}

async fn call_variant(
    services: &Arc<ServiceContainer>,
    session_id: &str,
    args: &Value,
    intent: Intent,
) -> ToolCallResult {
    let Some(name) = str_arg(args, "name") else {
        return ToolCallResult::error("missing 'name' parameter (namespaced server:tool)");
    };
    let arguments = args.get("arguments").cloned();
    let declaration = IntentDeclaration {
        kind: intent,
        reason: str_arg(args, "intent_reason").map(str::to_string),
        data_sensitivity: str_arg(args, "intent_data_sensitivity").map(str::to_string),
    };

    match services
        .router
        .call_tool(services, session_id, name, arguments, Some(declaration))
        .await
    {
        Ok(result) => result,
        Err(e) => ToolCallResult::error(e.to_string()),
    }
}

async fn upstream_servers(services: &Arc<ServiceContainer>, args: &Value) -> ToolCallResult {
    let Some(operation) = str_arg(args, "operation") else {
        return ToolCallResult::error("missing 'operation' parameter");
    };

    if operation == "list" {
        let statuses = services.manager.all().await;
        return json_result(&json!({ "servers": statuses }));
    }

    let record_change = |server: &str, change: &str| {
        let record = ActivityRecord::new(if change.contains("quarantine") {
            ActivityType::QuarantineChange
        } else {
            ActivityType::ServerChange
        })
        .with_server(server)
        .with_status(ActivityStatus::Success)
        .with_metadata(json!({ "change": change }));
        services.activity.record(record);
    };

    let result: Result<String, String> = match operation {
        "add" | "update" => {
            let Some(config_value) = args.get("config") else {
                return ToolCallResult::error("add/update requires a 'config' object");
            };
            match serde_json::from_value::<ServerConfig>(config_value.clone()) {
                Ok(server_config) => {
                    use mcpproxy_config::validation::Validatable;
                    if let Err(e) = server_config.validate() {
                        Err(e.to_string())
                    } else {
                        let name = server_config.name.clone();
                        let apply = async {
                            if operation == "update" {
                                services.manager.remove(&name).await.map_err(|e| e.to_string())?;
                            }
                            services
                                .manager
                                .add(server_config.clone())
                                .await
                                .map_err(|e| e.to_string())
                        };
                        match apply.await {
                            Ok(()) => {
                                let mut config = services.config.write();
                                config.mcp_servers.retain(|s| s.name != name);
                                config.mcp_servers.push(server_config);
                                drop(config);
                                services.oauth.update_servers(&services.config.read().mcp_servers);
                                services.save_config();
                                record_change(&name, operation);
                                Ok(format!("server '{}' {}ed", name, operation.trim_end_matches('e')))
                            }
                            Err(e) => Err(e),
                        }
                    }
                }
                Err(e) => Err(format!("invalid server config: {}", e)),
            }
        }
        "remove" | "enable" | "disable" | "restart" | "quarantine" | "unquarantine" => {
            let Some(name) = str_arg(args, "name") else {
                return ToolCallResult::error(format!("{} requires a 'name' parameter", operation));
            };
            let outcome = match operation {
                "remove" => services.manager.remove(name).await,
                "enable" => services.manager.enable(name).await,
                "disable" => services.manager.disable(name).await,
                "restart" => services.manager.restart(name).await,
                "quarantine" => services.manager.set_quarantine(name, true).await,
                "unquarantine" => services.manager.set_quarantine(name, false).await,
                _ => unreachable!(),
            };
            match outcome {
                Ok(()) => {
                    {
                        let mut config = services.config.write();
                        match operation {
                            "remove" => config.mcp_servers.retain(|s| s.name != name),
                            "enable" | "disable" => {
                                if let Some(s) =
                                    config.mcp_servers.iter_mut().find(|s| s.name == name)
                                {
                                    s.enabled = operation == "enable";
                                }
                            }
                            "quarantine" | "unquarantine" => {
                                if let Some(s) =
                                    config.mcp_servers.iter_mut().find(|s| s.name == name)
                                {
                                    s.quarantined = operation == "quarantine";
                                }
                            }
                            _ => {}
                        }
                    }
                    services.save_config();
                    record_change(name, operation);
                    Ok(format!("server '{}': {} applied", name, operation))
                }
                Err(e) => Err(e.to_string()),
            }
        }
        other => Err(format!("unknown operation '{}'", other)),
    };

    match result {
        Ok(message) => json_result(&json!({ "status": message })),
        Err(e) => ToolCallResult::error(e),
    }
}

async fn search_servers(services: &Arc<ServiceContainer>, args: &Value) -> ToolCallResult {
    if !services.config.read().check_server_repo {
        return ToolCallResult::error(
            "registry search is disabled (check_server_repo = false)",
        );
    }
    let Some(registry_name) = str_arg(args, "registry") else {
        return ToolCallResult::error("missing 'registry' parameter");
    };
    let Some(query) = str_arg(args, "query") else {
        return ToolCallResult::error("missing 'query' parameter");
    };
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(10);

    match registry::search_servers(registry_name, query, limit).await {
        Ok(servers) => json_result(&json!({ "servers": servers })),
        Err(e) => ToolCallResult::error(e),
    }
}

// `FromStr` used by the CLI when parsing intent flags
impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Intent::Read),
            "write" => Ok(Intent::Write),
            "destructive" => Ok(Intent::Destructive),
            other => Err(format!("unknown intent: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_use_flat_intent_params() {
        let tools = definitions();
        let destructive = tools
            .iter()
            .find(|t| t.name == CALL_TOOL_DESTRUCTIVE)
            .unwrap();
        let props = destructive.input_schema["properties"].as_object().unwrap();

        // Flat string parameters, never nested objects
        assert_eq!(props["intent_reason"]["type"], "string");
        assert_eq!(props["intent_data_sensitivity"]["type"], "string");
        assert!(destructive.input_schema["required"]
            .as_array()
            .unwrap()
            .contains(&json!("intent_reason")));
    }

    #[test]
    fn test_is_builtin() {
        assert!(is_builtin(RETRIEVE_TOOLS));
        assert!(is_builtin(UPSTREAM_SERVERS));
        assert!(!is_builtin("github:get_file"));
    }

    #[test]
    fn test_intent_parses() {
        assert_eq!("read".parse::<Intent>().unwrap(), Intent::Read);
        assert!("bogus".parse::<Intent>().is_err());
    }
}
