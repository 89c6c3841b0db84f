//! Service container
//!
//! All long-lived components, constructed once in dependency order and
//! shared as one `Arc`. No module-level mutable state anywhere: everything
//! reaches its collaborators through this container.

use parking_lot::RwLock;
use std::sync::Arc;

use mcpproxy_auth::{OAuthClient, RefreshManager};
use mcpproxy_config::ProxyConfig;
use mcpproxy_index::{IndexEntry, ToolIndex};
use mcpproxy_mcp::{StderrSink, UpstreamEvent, UpstreamManager};
use mcpproxy_security::{CoverageMode, FlowTracker, PolicyEngine, TokenCounter, TtlCache};
use mcpproxy_storage::{
    ensure_data_dir, ActivityStore, LogRingStore, ProxyDb, TokenStore,
};
use mcpproxy_web::{events::channels, ApiKeyConfig, EventBus, RateLimiter};

use crate::activity::ActivityService;
use crate::auth_bridge::OAuthBridge;
use crate::hooks::HookEvaluator;
use crate::router::ToolRouter;

/// Requests per minute allowed per TCP client
const TCP_RATE_LIMIT_PER_MINUTE: u32 = 120;

/// Everything the handlers need, constructed by `ServiceContainer::new`
pub struct ServiceContainer {
    /// Live configuration plus a monotonic epoch
    pub config: RwLock<ProxyConfig>,
    pub config_epoch: std::sync::atomic::AtomicU64,

    pub db: ProxyDb,
    pub token_store: TokenStore,
    pub log_rings: LogRingStore,
    pub activity: ActivityService,
    pub index: Arc<ToolIndex>,
    pub flow: Arc<FlowTracker>,
    pub policy: RwLock<PolicyEngine>,
    pub manager: UpstreamManager,
    pub oauth: Arc<OAuthClient>,
    pub refresh: RefreshManager,
    pub events: EventBus,
    pub tokens_counter: Option<Arc<TokenCounter>>,
    pub router: ToolRouter,
    pub hooks: HookEvaluator,
    pub api_key: Arc<ApiKeyConfig>,
    pub rate_limiter: Arc<RateLimiter>,

    /// Short-TTL cache for read-intent tool responses
    pub response_cache: TtlCache<String, mcpproxy_mcp::ToolCallResult>,

    /// Whether agent hooks are reported installed (set by hook status pings)
    pub hooks_active: std::sync::atomic::AtomicBool,

    /// Config file backing the running configuration, when one was given
    pub config_path: RwLock<Option<std::path::PathBuf>>,
}

impl ServiceContainer {
    /// Construct all services in dependency order
    pub async fn new(config: ProxyConfig) -> anyhow::Result<Arc<Self>> {
        // Storage first: the permission gate runs before anything listens
        ensure_data_dir(&config.data_dir)?;
        let db = ProxyDb::open(&config.data_dir)?;
        let token_store = TokenStore::new(db.clone());
        let log_rings =
            LogRingStore::new(db.clone()).with_log_dir(config.data_dir.join("logs"));
        let activity_store = ActivityStore::new(db.clone());

        let index = Arc::new(ToolIndex::open(&config.data_dir.join("index"))?);

        let events = EventBus::new();
        let activity = ActivityService::new(activity_store, events.clone());

        let flow = Arc::new(FlowTracker::new(config.security.flow_tracking.clone()));
        // Starts in proxy-only coverage; upgraded when a hook reports in
        let policy = RwLock::new(PolicyEngine::new(
            config.security.flow_policy.clone(),
            CoverageMode::ProxyOnly,
        ));

        let oauth = OAuthClient::new(token_store.clone())?;
        oauth.update_servers(&config.mcp_servers);
        let refresh = RefreshManager::spawn(oauth.clone());

        let auth_bridge = Arc::new(OAuthBridge::new(oauth.clone()));
        let stderr_rings = log_rings.clone();
        let stderr_factory: mcpproxy_mcp::manager::StderrSinkFactory =
            Arc::new(move |server: &str| -> StderrSink {
                let rings = stderr_rings.clone();
                let server = server.to_string();
                Arc::new(move |line: String| {
                    if let Err(e) = rings.push_line(&server, &line) {
                        tracing::debug!(server = %server, error = %e, "Log ring write failed");
                    }
                })
            });

        let manager = UpstreamManager::new(
            config.tool_response_limit,
            Some(auth_bridge),
            Some(stderr_factory),
        );

        let tokens_counter = if config.tokenizer.enabled {
            Some(Arc::new(TokenCounter::new(&config.tokenizer.encoding)))
        } else {
            None
        };

        let api_key = Arc::new(ApiKeyConfig {
            api_key: config.api_key.clone(),
        });
        let rate_limiter = RateLimiter::new(TCP_RATE_LIMIT_PER_MINUTE);

        let router = ToolRouter::new();
        let hooks = HookEvaluator::new(config.security.hooks.clone());

        let container = Arc::new(Self {
            config: RwLock::new(config),
            config_epoch: std::sync::atomic::AtomicU64::new(1),
            db,
            token_store,
            log_rings,
            activity,
            index,
            flow,
            policy,
            manager,
            oauth,
            refresh,
            events,
            tokens_counter,
            router,
            hooks,
            api_key,
            rate_limiter,
            response_cache: TtlCache::new(std::time::Duration::from_secs(30), 256),
            hooks_active: std::sync::atomic::AtomicBool::new(false),
            config_path: RwLock::new(None),
        });

        Ok(container)
    }

    /// Current coverage mode
    pub fn coverage_mode(&self) -> CoverageMode {
        self.policy.read().mode()
    }

    /// Flip to hook-enhanced coverage the first time a hook reports in
    pub fn mark_hooks_active(&self) {
        use std::sync::atomic::Ordering;
        if !self.hooks_active.swap(true, Ordering::SeqCst) {
            let config = self.config.read().security.flow_policy.clone();
            *self.policy.write() = PolicyEngine::new(config, CoverageMode::HookEnhanced);
            tracing::info!("Agent hooks active; coverage upgraded to hook_enhanced");
        }
    }

    /// Start the background maintenance tasks
    ///
    /// Returns handles so shutdown can abort them deterministically.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        // Keep the retrieval index in lockstep with upstream changes
        {
            let services = self.clone();
            let mut events = self.manager.subscribe();
            tasks.push(tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    services.handle_upstream_event(&event).await;
                }
            }));
        }

        // Evict idle flow sessions and log their summaries
        {
            let services = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    for summary in services.flow.evict_idle() {
                        services.activity.record_flow_summary(&summary);
                    }
                }
            }));
        }

        // Schedule refreshes for every stored token set
        {
            let services = self.clone();
            tasks.push(tokio::spawn(async move {
                match services.token_store.list() {
                    Ok(token_sets) => {
                        for tokens in token_sets {
                            services.refresh.enable(tokens).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Could not load stored tokens"),
                }

                // Forward refresh outcomes to the event bus; a terminal
                // failure invalidates the stored token set
                let mut events = services.refresh.subscribe();
                while let Ok(event) = events.recv().await {
                    if let mcpproxy_auth::RefreshEvent::RefreshFailed {
                        server,
                        error,
                        terminal: true,
                    } = &event
                    {
                        if let Err(e) = services.token_store.delete_for_server(server) {
                            tracing::warn!(server = %server, error = %e, "Token cleanup failed");
                        }
                        let record = mcpproxy_storage::ActivityRecord::new(
                            mcpproxy_storage::ActivityType::ServerChange,
                        )
                        .with_server(server.clone())
                        .with_status(mcpproxy_storage::ActivityStatus::Error)
                        .with_metadata(serde_json::json!({
                            "change": "oauth_refresh_failed",
                            "error": error,
                        }));
                        services.activity.record(record);
                    }
                    services.events.publish(
                        channels::OAUTH,
                        serde_json::to_value(&event).unwrap_or_default(),
                    );
                }
            }));
        }

        tasks
    }

    async fn handle_upstream_event(&self, event: &UpstreamEvent) {
        self.events.publish(
            channels::SERVER_STATUS,
            serde_json::to_value(event).unwrap_or_default(),
        );

        // The index mirrors the visible tool set exactly: tools of servers
        // that are quarantined, disabled or disconnected must drop out.
        match event {
            UpstreamEvent::ToolsUpdated { server, .. }
            | UpstreamEvent::QuarantineChanged { server, .. }
            | UpstreamEvent::StateChanged { server, .. } => {
                self.reindex_server(server).await;
            }
            UpstreamEvent::Removed { server } => {
                if let Err(e) = self.index.delete_by_server(server) {
                    tracing::warn!(server = %server, error = %e, "Index delete failed");
                }
            }
            _ => {}
        }
    }

    /// Rebuild the index entries for one server from its visible tools
    pub async fn reindex_server(&self, server: &str) {
        let visible = self.manager.visible_tools().await;
        let entries: Vec<IndexEntry> = visible
            .into_iter()
            .filter(|(name, _)| name == server)
            .map(|(name, tool)| IndexEntry {
                server: name,
                name: tool.name.clone(),
                description: tool.description.clone(),
                labels: tool
                    .annotations
                    .as_ref()
                    .map(|a| a.labels().iter().map(|s| s.to_string()).collect())
                    .unwrap_or_default(),
            })
            .collect();

        let result = if entries.is_empty() {
            self.index.delete_by_server(server)
        } else {
            self.index.upsert(&entries)
        };
        if let Err(e) = result {
            tracing::warn!(server = %server, error = %e, "Index update failed");
        }
    }

    /// Bump and read the config epoch
    pub fn next_config_epoch(&self) -> u64 {
        use std::sync::atomic::Ordering;
        self.config_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current config epoch
    pub fn current_epoch(&self) -> u64 {
        self.config_epoch.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Write the running configuration back to its file, when one exists
    pub fn save_config(&self) {
        let path = self.config_path.read().clone();
        let Some(path) = path else { return };
        let snapshot = self.config.read().clone();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    tracing::warn!(path = %path.display(), error = %e, "Config save failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Config serialize failed"),
        }
    }
}
