//! Public MCP-server registry catalog
//!
//! `list_registries` names the known public catalogs; `search_servers`
//! fetches one and filters its entries. Both are discovery aids only;
//! nothing here installs a server.

use serde::{Deserialize, Serialize};

/// A known public registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub name: String,
    pub url: String,
    pub description: String,
}

/// An entry returned by a registry search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryServer {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Built-in catalog of public registries
pub fn known_registries() -> Vec<Registry> {
    vec![
        Registry {
            name: "mcp-official".into(),
            url: "https://registry.modelcontextprotocol.io/v0/servers".into(),
            description: "Official MCP server registry".into(),
        },
        Registry {
            name: "pulse".into(),
            url: "https://api.pulsemcp.com/v0beta/servers".into(),
            description: "PulseMCP community server directory".into(),
        },
    ]
}

/// Search one registry by substring match over name and description
pub async fn search_servers(
    registry_name: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<RegistryServer>, String> {
    let registry = known_registries()
        .into_iter()
        .find(|r| r.name == registry_name)
        .ok_or_else(|| format!("unknown registry '{}'", registry_name))?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .map_err(|e| e.to_string())?;

    let body: serde_json::Value = client
        .get(&registry.url)
        .send()
        .await
        .map_err(|e| format!("registry fetch failed: {}", e))?
        .json()
        .await
        .map_err(|e| format!("registry returned invalid JSON: {}", e))?;

    // Registries disagree on envelope shape; accept a bare array or a
    // {servers: [...]} wrapper.
    let entries = body
        .as_array()
        .cloned()
        .or_else(|| body.get("servers").and_then(|v| v.as_array()).cloned())
        .unwrap_or_default();

    let needle = query.to_lowercase();
    let mut results: Vec<RegistryServer> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<RegistryServer>(entry).ok())
        .filter(|server| {
            needle.is_empty()
                || server.name.to_lowercase().contains(&needle)
                || server.description.to_lowercase().contains(&needle)
        })
        .collect();
    results.truncate(limit.max(1).min(50));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_registries_are_well_formed() {
        let registries = known_registries();
        assert!(!registries.is_empty());
        for registry in registries {
            assert!(registry.url.starts_with("https://"));
            assert!(!registry.name.is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_registry_is_an_error() {
        let err = search_servers("nope", "files", 5).await.unwrap_err();
        assert!(err.contains("unknown registry"));
    }
}
