//! Server startup and shutdown
//!
//! Brings the components up in dependency order (storage gate first, then
//! stores, auth, upstreams, security, listeners), watches the config file,
//! and tears everything down deterministically on shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use mcpproxy_config::{ConfigError, ProxyConfig};
use mcpproxy_storage::{ActivityType, StorageError};
use mcpproxy_web::{DualListener, WebError};

use crate::api;
use crate::reload;
use crate::services::ServiceContainer;

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    General = 1,
    PortConflict = 2,
    StorageLocked = 3,
    Config = 4,
    InsecureDataDir = 5,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a startup error onto the documented exit codes
    pub fn from_error(error: &anyhow::Error) -> Self {
        if let Some(storage) = error.downcast_ref::<StorageError>() {
            return match storage {
                StorageError::InsecureDataDir { .. } => ExitCode::InsecureDataDir,
                StorageError::Locked { .. } => ExitCode::StorageLocked,
                _ => ExitCode::General,
            };
        }
        if error.downcast_ref::<ConfigError>().is_some() {
            return ExitCode::Config;
        }
        if let Some(web) = error.downcast_ref::<WebError>() {
            if matches!(web, WebError::Conflict(_)) {
                return ExitCode::PortConflict;
            }
        }
        ExitCode::General
    }
}

/// Running server instance
pub struct Server {
    services: Arc<ServiceContainer>,
    listener: DualListener,
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    _config_watcher: Option<notify::RecommendedWatcher>,
}

impl Server {
    /// Bring everything up in dependency order
    pub async fn start(config: ProxyConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let socket_path = resolve_socket_path(&config);
        let initial_servers = config.mcp_servers.clone();

        // Storage and all services; the data-dir gate runs inside
        let services = ServiceContainer::new(config).await?;
        *services.config_path.write() = config_path.clone();

        let background_tasks = services.spawn_background_tasks();

        // Upstreams start connecting concurrently; none blocks startup
        services
            .manager
            .reconcile(initial_servers)
            .await
            .map_err(|e| anyhow::anyhow!("initial reconcile failed: {}", e))?;

        // Listeners open last, after every component they route to exists
        let router = api::build_router(services.clone());
        let listen = services.config.read().listen.clone();
        let listener = DualListener::serve(&listen, socket_path.as_deref(), router).await?;

        tracing::info!(
            tcp = %listener.tcp_addr(),
            socket = ?listener.socket_path(),
            "MCPProxy listening"
        );

        let config_watcher = match &config_path {
            Some(path) if path.exists() => {
                match reload::spawn_config_watcher(services.clone(), path) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watcher unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        services.activity.record_system(ActivityType::SystemStart);

        Ok(Self {
            services,
            listener,
            background_tasks,
            _config_watcher: config_watcher,
        })
    }

    /// Shared services (CLI subcommands reuse them in-process)
    pub fn services(&self) -> Arc<ServiceContainer> {
        self.services.clone()
    }

    /// Bound TCP address
    pub fn tcp_addr(&self) -> std::net::SocketAddr {
        self.listener.tcp_addr()
    }

    /// Serve until SIGINT/SIGTERM, then shut down gracefully
    pub async fn run_until_shutdown(self) -> Result<()> {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        self.shutdown().await
    }

    /// Deterministic teardown: stop accepting, close upstreams, flush state
    pub async fn shutdown(self) -> Result<()> {
        self.listener.shutdown().await;

        for task in &self.background_tasks {
            task.abort();
        }

        self.services.manager.shutdown().await;
        self.services.refresh.shutdown().await;

        // Evicting every flow session emits their summaries
        for summary in self.services.flow.drain() {
            self.services.activity.record_flow_summary(&summary);
        }
        self.services.activity.record_system(ActivityType::SystemStop);

        self.services.db.flush()?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

/// Socket path from `tray_endpoint`, defaulting under the data dir
fn resolve_socket_path(config: &ProxyConfig) -> Option<PathBuf> {
    match &config.tray_endpoint {
        Some(endpoint) => endpoint
            .strip_prefix("unix://")
            .map(PathBuf::from)
            .or_else(|| {
                tracing::warn!(endpoint = %endpoint, "Unsupported tray endpoint scheme on this platform");
                None
            }),
        None => Some(config.default_socket_path()),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Resolve the socket path for CLI clients (hook fast path, doctor)
pub fn client_socket_path(config: &ProxyConfig) -> Option<PathBuf> {
    resolve_socket_path(config)
}

/// Check whether a path looks like a live daemon socket
#[cfg(unix)]
pub fn socket_is_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(not(unix))]
pub fn socket_is_live(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::PortConflict.code(), 2);
        assert_eq!(ExitCode::StorageLocked.code(), 3);
        assert_eq!(ExitCode::Config.code(), 4);
        assert_eq!(ExitCode::InsecureDataDir.code(), 5);
    }

    #[test]
    fn test_exit_code_mapping() {
        let insecure: anyhow::Error = StorageError::InsecureDataDir {
            path: "/tmp/x".into(),
            mode: 0o755,
        }
        .into();
        assert_eq!(ExitCode::from_error(&insecure), ExitCode::InsecureDataDir);

        let conflict: anyhow::Error = WebError::Conflict("bind".into()).into();
        assert_eq!(ExitCode::from_error(&conflict), ExitCode::PortConflict);

        let config: anyhow::Error =
            ConfigError::ValidationError("bad".into()).into();
        assert_eq!(ExitCode::from_error(&config), ExitCode::Config);
    }

    #[test]
    fn test_socket_path_resolution() {
        let mut config = ProxyConfig::default();
        assert_eq!(
            resolve_socket_path(&config),
            Some(config.data_dir.join("mcpproxy.sock"))
        );

        config.tray_endpoint = Some("unix:///tmp/custom.sock".into());
        assert_eq!(resolve_socket_path(&config), Some(PathBuf::from("/tmp/custom.sock")));
    }
}
