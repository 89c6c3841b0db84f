//! Upstream fleet manager
//!
//! Owns every `UpstreamSession`, reconciles them against configuration
//! changes, and republishes their state transitions on one broadcast stream.
//! A failing upstream never blocks the others; it is retained in `error`
//! state with its `last_error` visible.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{McpError, McpResult};
use crate::protocol::Tool;
use crate::session::{
    BearerTokenProvider, SessionState, SessionStatus, StderrSink, UpstreamSession,
};
use mcpproxy_config::ServerConfig;

/// Builds a stderr sink for a named server (wired to the log ring store)
pub type StderrSinkFactory = Arc<dyn Fn(&str) -> StderrSink + Send + Sync>;

/// Event published when an upstream changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamEvent {
    Added { server: String },
    Removed { server: String },
    StateChanged { server: String, state: SessionState },
    ToolsUpdated { server: String, tool_count: usize },
    QuarantineChanged { server: String, quarantined: bool },
}

impl UpstreamEvent {
    /// Server the event concerns
    pub fn server(&self) -> &str {
        match self {
            UpstreamEvent::Added { server }
            | UpstreamEvent::Removed { server }
            | UpstreamEvent::StateChanged { server, .. }
            | UpstreamEvent::ToolsUpdated { server, .. }
            | UpstreamEvent::QuarantineChanged { server, .. } => server,
        }
    }
}

/// Combined configuration + session view of one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub protocol: String,
    pub enabled: bool,
    pub quarantined: bool,
    #[serde(flatten)]
    pub session: SessionStatus,
}

struct ManagedUpstream {
    config: ServerConfig,
    /// Absent while the server is disabled
    session: Option<UpstreamSession>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Result of one configuration reconcile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

struct ManagerInner {
    upstreams: RwLock<HashMap<String, ManagedUpstream>>,
    default_response_limit: usize,
    auth: Option<Arc<dyn BearerTokenProvider>>,
    stderr_sinks: Option<StderrSinkFactory>,
    events_tx: broadcast::Sender<UpstreamEvent>,
}

/// Supervisor for all upstream sessions
#[derive(Clone)]
pub struct UpstreamManager {
    inner: Arc<ManagerInner>,
}

impl UpstreamManager {
    pub fn new(
        default_response_limit: usize,
        auth: Option<Arc<dyn BearerTokenProvider>>,
        stderr_sinks: Option<StderrSinkFactory>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                upstreams: RwLock::new(HashMap::new()),
                default_response_limit,
                auth,
                stderr_sinks,
                events_tx,
            }),
        }
    }

    /// Subscribe to upstream change events
    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.inner.events_tx.subscribe()
    }

    fn emit(&self, event: UpstreamEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    /// Bring the manager in line with a full set of server configs
    ///
    /// Unchanged servers are left alone; changed ones get a graceful restart.
    /// Idempotent: reconciling the same set twice is a no-op.
    pub async fn reconcile(&self, configs: Vec<ServerConfig>) -> McpResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let incoming: HashMap<String, ServerConfig> =
            configs.into_iter().map(|c| (c.name.clone(), c)).collect();

        let existing: HashSet<String> = {
            let upstreams = self.inner.upstreams.read().await;
            upstreams.keys().cloned().collect()
        };

        for name in existing.iter() {
            if !incoming.contains_key(name) {
                self.remove(name).await?;
                report.removed.push(name.clone());
            }
        }

        for (name, config) in incoming {
            if !existing.contains(&name) {
                self.add(config).await?;
                report.added.push(name);
            } else {
                let needs_restart = {
                    let upstreams = self.inner.upstreams.read().await;
                    upstreams
                        .get(&name)
                        .is_some_and(|managed| managed.config != config)
                };
                if needs_restart {
                    self.remove(&name).await?;
                    self.add(config).await?;
                    report.changed.push(name);
                }
            }
        }

        Ok(report)
    }

    /// Add one upstream and start it if enabled
    pub async fn add(&self, config: ServerConfig) -> McpResult<()> {
        let name = config.name.clone();
        {
            let upstreams = self.inner.upstreams.read().await;
            if upstreams.contains_key(&name) {
                return Err(McpError::Configuration {
                    message: format!("upstream '{}' already exists", name),
                });
            }
        }

        let managed = if config.enabled {
            self.spawn_session(config)?
        } else {
            ManagedUpstream {
                config,
                session: None,
                tasks: Vec::new(),
            }
        };

        self.inner.upstreams.write().await.insert(name.clone(), managed);
        self.emit(UpstreamEvent::Added { server: name });
        Ok(())
    }

    fn spawn_session(&self, config: ServerConfig) -> McpResult<ManagedUpstream> {
        let name = config.name.clone();
        let stderr_sink = self.inner.stderr_sinks.as_ref().map(|factory| factory(&name));
        let session = UpstreamSession::new(
            config.clone(),
            self.inner.default_response_limit,
            self.inner.auth.clone(),
            stderr_sink,
        )?;

        let run_task = session.start();

        // Forward status transitions onto the shared event stream
        let forwarder = {
            let mut rx = session.subscribe();
            let manager = self.clone();
            let server = name.clone();
            tokio::spawn(async move {
                let mut last_state = SessionState::Created;
                let mut last_tool_count = 0usize;
                while rx.changed().await.is_ok() {
                    let status = rx.borrow().clone();
                    if status.state != last_state {
                        last_state = status.state;
                        manager.emit(UpstreamEvent::StateChanged {
                            server: server.clone(),
                            state: status.state,
                        });
                    }
                    if status.tool_count != last_tool_count {
                        last_tool_count = status.tool_count;
                        manager.emit(UpstreamEvent::ToolsUpdated {
                            server: server.clone(),
                            tool_count: status.tool_count,
                        });
                    }
                }
            })
        };

        Ok(ManagedUpstream {
            config,
            session: Some(session),
            tasks: vec![run_task, forwarder],
        })
    }

    /// Remove one upstream, closing its session
    pub async fn remove(&self, name: &str) -> McpResult<()> {
        let managed = self.inner.upstreams.write().await.remove(name);
        let Some(managed) = managed else {
            return Err(McpError::Configuration {
                message: format!("unknown upstream '{}'", name),
            });
        };

        if let Some(session) = &managed.session {
            session.close().await;
        }
        for task in managed.tasks {
            task.abort();
        }

        self.emit(UpstreamEvent::Removed {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Enable a disabled upstream
    pub async fn enable(&self, name: &str) -> McpResult<()> {
        let config = {
            let mut upstreams = self.inner.upstreams.write().await;
            let managed = upstreams.get_mut(name).ok_or_else(|| McpError::Configuration {
                message: format!("unknown upstream '{}'", name),
            })?;
            if managed.session.is_some() {
                return Ok(());
            }
            managed.config.enabled = true;
            managed.config.clone()
        };

        let spawned = self.spawn_session(config)?;
        let mut upstreams = self.inner.upstreams.write().await;
        if let Some(managed) = upstreams.get_mut(name) {
            managed.session = spawned.session;
            managed.tasks = spawned.tasks;
        }
        Ok(())
    }

    /// Disable an upstream, closing its session but keeping its config
    pub async fn disable(&self, name: &str) -> McpResult<()> {
        let mut upstreams = self.inner.upstreams.write().await;
        let managed = upstreams.get_mut(name).ok_or_else(|| McpError::Configuration {
            message: format!("unknown upstream '{}'", name),
        })?;

        managed.config.enabled = false;
        if let Some(session) = managed.session.take() {
            session.close().await;
        }
        for task in managed.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    /// Restart an upstream (or wake one held in error)
    pub async fn restart(&self, name: &str) -> McpResult<()> {
        let config = {
            let upstreams = self.inner.upstreams.read().await;
            let managed = upstreams.get(name).ok_or_else(|| McpError::Configuration {
                message: format!("unknown upstream '{}'", name),
            })?;
            if let Some(session) = &managed.session {
                if session.status().held {
                    session.kick();
                    return Ok(());
                }
            }
            managed.config.clone()
        };

        self.remove(name).await?;
        self.add(config).await
    }

    /// Set the quarantine flag
    pub async fn set_quarantine(&self, name: &str, quarantined: bool) -> McpResult<()> {
        {
            let mut upstreams = self.inner.upstreams.write().await;
            let managed = upstreams.get_mut(name).ok_or_else(|| McpError::Configuration {
                message: format!("unknown upstream '{}'", name),
            })?;
            managed.config.quarantined = quarantined;
        }
        self.emit(UpstreamEvent::QuarantineChanged {
            server: name.to_string(),
            quarantined,
        });
        Ok(())
    }

    /// Get the live session for a server
    pub async fn get(&self, name: &str) -> Option<UpstreamSession> {
        self.inner
            .upstreams
            .read()
            .await
            .get(name)
            .and_then(|m| m.session.clone())
    }

    /// Get the stored configuration for a server
    pub async fn get_config(&self, name: &str) -> Option<ServerConfig> {
        self.inner
            .upstreams
            .read()
            .await
            .get(name)
            .map(|m| m.config.clone())
    }

    /// Status of every upstream, sorted by name
    pub async fn all(&self) -> Vec<UpstreamStatus> {
        let upstreams = self.inner.upstreams.read().await;
        let mut statuses: Vec<UpstreamStatus> = upstreams
            .values()
            .map(|managed| {
                let session = managed
                    .session
                    .as_ref()
                    .map(|s| s.status())
                    .unwrap_or_else(|| SessionStatus {
                        state: SessionState::Closed,
                        connected: false,
                        tool_count: 0,
                        retry_count: 0,
                        last_error: None,
                        server_info: None,
                        session_id: None,
                        held: false,
                    });
                UpstreamStatus {
                    name: managed.config.name.clone(),
                    protocol: managed.config.protocol.as_str().to_string(),
                    enabled: managed.config.enabled,
                    quarantined: managed.config.quarantined,
                    session,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// All current server configs, sorted by name
    pub async fn configs(&self) -> Vec<ServerConfig> {
        let upstreams = self.inner.upstreams.read().await;
        let mut configs: Vec<ServerConfig> =
            upstreams.values().map(|m| m.config.clone()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Tools visible for retrieval: connected, enabled, not quarantined
    pub async fn visible_tools(&self) -> Vec<(String, Tool)> {
        let snapshot: Vec<(String, bool, Option<UpstreamSession>)> = {
            let upstreams = self.inner.upstreams.read().await;
            upstreams
                .values()
                .map(|m| {
                    (
                        m.config.name.clone(),
                        m.config.quarantined,
                        m.session.clone(),
                    )
                })
                .collect()
        };

        let mut tools = Vec::new();
        for (name, quarantined, session) in snapshot {
            if quarantined {
                continue;
            }
            let Some(session) = session else { continue };
            if session.status().state != SessionState::Ready {
                continue;
            }
            for tool in session.tools().await {
                tools.push((name.clone(), tool));
            }
        }
        tools
    }

    /// Close every session (shutdown)
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let upstreams = self.inner.upstreams.read().await;
            upstreams.keys().cloned().collect()
        };
        for name in names {
            let _ = self.remove(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_cfg(name: &str) -> ServerConfig {
        ServerConfig::stdio(name, "cat")
    }

    #[tokio::test]
    async fn test_add_remove_and_events() {
        let manager = UpstreamManager::new(20_000, None, None);
        let mut events = manager.subscribe();

        manager.add(stdio_cfg("fs")).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            UpstreamEvent::Added { .. }
        ));

        assert!(manager.add(stdio_cfg("fs")).await.is_err());

        manager.remove("fs").await.unwrap();
        assert!(manager.get("fs").await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_diffs_added_removed_changed() {
        let manager = UpstreamManager::new(20_000, None, None);
        manager.add(stdio_cfg("a")).await.unwrap();
        manager.add(stdio_cfg("b")).await.unwrap();

        let mut changed_b = stdio_cfg("b");
        changed_b.args = vec!["-u".to_string()];

        let report = manager
            .reconcile(vec![changed_b, stdio_cfg("c")])
            .await
            .unwrap();
        assert_eq!(report.added, vec!["c".to_string()]);
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(report.changed, vec!["b".to_string()]);

        // Idempotent: same set again is a no-op
        let mut changed_b = stdio_cfg("b");
        changed_b.args = vec!["-u".to_string()];
        let report = manager
            .reconcile(vec![changed_b, stdio_cfg("c")])
            .await
            .unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_disabled_server_has_no_session() {
        let manager = UpstreamManager::new(20_000, None, None);
        let mut cfg = stdio_cfg("fs");
        cfg.enabled = false;
        manager.add(cfg).await.unwrap();

        assert!(manager.get("fs").await.is_none());
        let all = manager.all().await;
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);

        manager.enable("fs").await.unwrap();
        assert!(manager.get("fs").await.is_some());
    }

    #[tokio::test]
    async fn test_quarantine_flag_and_event() {
        let manager = UpstreamManager::new(20_000, None, None);
        manager.add(stdio_cfg("fs")).await.unwrap();
        let mut events = manager.subscribe();

        manager.set_quarantine("fs", true).await.unwrap();
        let event = loop {
            match events.recv().await.unwrap() {
                UpstreamEvent::QuarantineChanged { quarantined, .. } => break quarantined,
                _ => continue,
            }
        };
        assert!(event);
        assert!(manager.get_config("fs").await.unwrap().quarantined);

        // Quarantined servers contribute no visible tools
        assert!(manager.visible_tools().await.is_empty());
    }
}
