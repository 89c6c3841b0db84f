//! Configuration hot reload
//!
//! The config file is watched for changes; a change revalidates and applies
//! the hot-reloadable subset (upstream servers, limits, security policy).
//! Fields that require a restart (listen address, data dir, IPC endpoint,
//! API key) are reported, and the running process keeps its prior values.

use notify::{RecursiveMode, Watcher};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use mcpproxy_config::{ConfigLoader, ProxyConfig};
use mcpproxy_security::PolicyEngine;
use mcpproxy_web::events::channels;

use crate::services::ServiceContainer;

/// Result of one apply
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Hot fields that changed and were applied
    pub applied: Vec<String>,

    /// Cold fields that changed but need a restart
    pub requires_restart: Vec<String>,

    /// Config epoch after the apply
    pub epoch: u64,
}

/// Apply a validated configuration to the running services
///
/// Atomic per the config epoch: the shared config swaps once, after every
/// hot component accepted its delta.
pub async fn apply_config(
    services: &Arc<ServiceContainer>,
    incoming: ProxyConfig,
) -> Result<ApplyOutcome, String> {
    let current = services.config.read().clone();

    let mut applied = Vec::new();
    let mut requires_restart = Vec::new();

    for (field, changed) in [
        ("listen", incoming.listen != current.listen),
        ("data_dir", incoming.data_dir != current.data_dir),
        ("tray_endpoint", incoming.tray_endpoint != current.tray_endpoint),
        ("api_key", incoming.api_key != current.api_key),
        ("tokenizer", incoming.tokenizer != current.tokenizer),
    ] {
        if changed {
            requires_restart.push(field.to_string());
        }
    }

    let servers_changed = incoming.mcp_servers != current.mcp_servers;
    let security_changed = incoming.security != current.security;
    let limits_changed = incoming.top_k != current.top_k
        || incoming.tools_limit != current.tools_limit
        || incoming.tool_response_limit != current.tool_response_limit
        || incoming.check_server_repo != current.check_server_repo;
    let logging_changed = incoming.logging != current.logging;

    // Reconcile upstreams first; it is the only fallible hot apply
    if servers_changed {
        let report = services
            .manager
            .reconcile(incoming.mcp_servers.clone())
            .await
            .map_err(|e| format!("reconcile failed: {}", e))?;
        services.oauth.update_servers(&incoming.mcp_servers);
        applied.push(format!(
            "mcpServers (+{} -{} ~{})",
            report.added.len(),
            report.removed.len(),
            report.changed.len()
        ));
    }

    if security_changed {
        let mode = services.policy.read().mode();
        *services.policy.write() =
            PolicyEngine::new(incoming.security.flow_policy.clone(), mode);
        applied.push("security".to_string());
    }

    if limits_changed {
        applied.push("limits".to_string());
    }
    if logging_changed {
        // The subscriber is installed once at startup; level changes apply
        // on the next start.
        requires_restart.push("logging".to_string());
    }

    // Swap the shared config; readers see old or new, never a mix
    {
        let mut config = services.config.write();
        let preserved_listen = config.listen.clone();
        let preserved_data_dir = config.data_dir.clone();
        let preserved_tray = config.tray_endpoint.clone();
        let preserved_key = config.api_key.clone();
        *config = incoming;
        // Cold fields keep their running values
        config.listen = preserved_listen;
        config.data_dir = preserved_data_dir;
        config.tray_endpoint = preserved_tray;
        config.api_key = preserved_key;
    }

    let epoch = services.next_config_epoch();
    services.events.publish(
        channels::CONFIG,
        json!({
            "epoch": epoch,
            "applied": applied,
            "requires_restart": requires_restart,
        }),
    );

    Ok(ApplyOutcome {
        applied,
        requires_restart,
        epoch,
    })
}

/// Watch the config file and apply changes as they land
pub fn spawn_config_watcher(
    services: Arc<ServiceContainer>,
    path: &Path,
) -> notify::Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(4);

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = tx.blocking_send(());
            }
        }
    })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    let path = path.to_path_buf();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Editors fire several events per save; settle first
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            while rx.try_recv().is_ok() {}

            match ConfigLoader::new().from_file(&path) {
                Ok(incoming) => match apply_config(&services, incoming).await {
                    Ok(outcome) => {
                        tracing::info!(
                            applied = ?outcome.applied,
                            requires_restart = ?outcome.requires_restart,
                            "Config reloaded"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Config apply failed"),
                },
                // Validation failure: keep running with the prior config
                Err(e) => tracing::error!(error = %e, "Config reload rejected"),
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_config::ServerConfig;

    async fn services() -> (Arc<ServiceContainer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            data_dir: dir.path().join("data"),
            ..Default::default()
        };
        let services = ServiceContainer::new(config).await.unwrap();
        (services, dir)
    }

    #[tokio::test]
    async fn test_apply_reports_cold_fields() {
        let (services, _dir) = services().await;
        let mut incoming = services.config.read().clone();
        incoming.listen = "127.0.0.1:9999".to_string();

        let outcome = apply_config(&services, incoming).await.unwrap();
        assert!(outcome.requires_restart.contains(&"listen".to_string()));
        // The running listen address is untouched
        assert_ne!(services.config.read().listen, "127.0.0.1:9999");
    }

    #[tokio::test]
    async fn test_apply_reconciles_servers_and_bumps_epoch() {
        let (services, _dir) = services().await;
        let before = services.current_epoch();

        let mut incoming = services.config.read().clone();
        incoming.mcp_servers.push(ServerConfig::stdio("fs", "cat"));

        let outcome = apply_config(&services, incoming).await.unwrap();
        assert!(outcome.applied.iter().any(|f| f.starts_with("mcpServers")));
        assert_eq!(outcome.epoch, before + 1);
        assert!(services.manager.get_config("fs").await.is_some());
    }
}
