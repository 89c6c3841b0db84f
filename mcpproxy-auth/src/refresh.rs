//! Proactive token refresh scheduling
//!
//! One scheduler task owns all refresh state; mutations arrive on a command
//! channel and each scheduled refresh is a timer task that fires a command
//! back into the scheduler. Refreshes run at two thirds of the token
//! lifetime; failures back off exponentially with an overflow-safe exponent
//! and a circuit breaker after a bounded number of consecutive failures.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::error::{AuthErrorClass, AuthResult};
use mcpproxy_storage::TokenSet;

/// Floor for any scheduled interval, guarding against scheduler bugs
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Default ceiling for failure backoff
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Default consecutive-failure budget before the circuit opens
pub const DEFAULT_MAX_RETRIES: u32 = 50;

/// Compute the backoff delay for a retry count
///
/// The exponent is capped before shifting: an uncapped `1 << retry_count`
/// wraps for counts ≥ 64 and would produce a zero delay, i.e. a tight retry
/// loop. A post-compute guard maps any non-positive result to `max_backoff`.
pub fn calculate_backoff(retry_count: u32, base: Duration, max_backoff: Duration) -> Duration {
    let exp = retry_count.min(25);
    let delay = base.saturating_mul(1u32 << exp).min(max_backoff);
    if delay.is_zero() {
        return max_backoff;
    }
    delay
}

/// Per-token refresh state, observable through `state()`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshState {
    /// Next refresh planned
    Scheduled { at: DateTime<Utc> },
    /// Refresh in flight
    Refreshing,
    /// Last refresh failed; retrying later
    Backoff { retry_count: u32, at: DateTime<Utc> },
    /// Circuit open; no further refreshes until user action
    Failed { error: String },
    /// Refreshing disabled for this server
    Disabled,
}

/// Event published on refresh outcomes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RefreshEvent {
    Refreshed { server: String },
    RefreshFailed { server: String, error: String, terminal: bool },
}

/// Performs the actual token refresh (implemented by `OAuthClient`)
#[async_trait]
pub trait RefreshExecutor: Send + Sync {
    async fn refresh(&self, server: &str) -> AuthResult<TokenSet>;
}

#[async_trait]
impl RefreshExecutor for crate::client::OAuthClient {
    async fn refresh(&self, server: &str) -> AuthResult<TokenSet> {
        crate::client::OAuthClient::refresh(self, server).await
    }
}

enum Command {
    Enable { server: String, tokens: TokenSet },
    Disable { server: String },
    Now { server: String },
    Fire { server: String, generation: u64 },
    Shutdown,
}

struct Entry {
    tokens: TokenSet,
    retry_count: u32,
    /// Invalidates stale timer tasks after re-enable/disable
    generation: u64,
    timer: Option<tokio::task::JoinHandle<()>>,
}

/// Refresh scheduler handle
#[derive(Clone)]
pub struct RefreshManager {
    commands: mpsc::Sender<Command>,
    states: Arc<RwLock<HashMap<String, RefreshState>>>,
    events_tx: broadcast::Sender<RefreshEvent>,
}

impl RefreshManager {
    /// Spawn the scheduler task
    pub fn spawn(executor: Arc<dyn RefreshExecutor>) -> Self {
        Self::spawn_with_limits(executor, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES)
    }

    pub fn spawn_with_limits(
        executor: Arc<dyn RefreshExecutor>,
        max_backoff: Duration,
        max_retries: u32,
    ) -> Self {
        // A zero retry budget would disable the breaker entirely
        let max_retries = max_retries.max(1);
        let (commands, rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(64);
        let states = Arc::new(RwLock::new(HashMap::new()));

        let manager = Self {
            commands: commands.clone(),
            states: states.clone(),
            events_tx: events_tx.clone(),
        };

        tokio::spawn(run_scheduler(
            rx,
            commands,
            states,
            events_tx,
            executor,
            max_backoff,
            max_retries,
        ));

        manager
    }

    /// Schedule refreshes for a token set
    pub async fn enable(&self, tokens: TokenSet) {
        let server = tokens.server_name.clone();
        let _ = self.commands.send(Command::Enable { server, tokens }).await;
    }

    /// Stop refreshing a server's tokens
    pub async fn disable(&self, server: &str) {
        let _ = self
            .commands
            .send(Command::Disable {
                server: server.to_string(),
            })
            .await;
    }

    /// Trigger an immediate refresh
    pub async fn refresh_now(&self, server: &str) {
        let _ = self
            .commands
            .send(Command::Now {
                server: server.to_string(),
            })
            .await;
    }

    /// Observable state for a server
    pub async fn state(&self, server: &str) -> Option<RefreshState> {
        self.states.read().await.get(server).cloned()
    }

    /// Subscribe to refresh events
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events_tx.subscribe()
    }

    /// Stop the scheduler
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

impl std::fmt::Debug for RefreshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshManager").finish_non_exhaustive()
    }
}

/// Delay until the next scheduled refresh: two thirds of the token lifetime
/// measured from issue, floored at `MIN_REFRESH_INTERVAL`
fn schedule_delay(tokens: &TokenSet, now: DateTime<Utc>) -> Duration {
    let Some(lifetime) = tokens.lifetime() else {
        // No expiry: nothing to schedule against; check again in an hour
        return Duration::from_secs(3600);
    };

    let refresh_at = tokens.issued_at + lifetime * 2 / 3;
    let delay = (refresh_at - now).to_std().unwrap_or(Duration::ZERO);
    delay.max(MIN_REFRESH_INTERVAL)
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler(
    mut rx: mpsc::Receiver<Command>,
    commands: mpsc::Sender<Command>,
    states: Arc<RwLock<HashMap<String, RefreshState>>>,
    events_tx: broadcast::Sender<RefreshEvent>,
    executor: Arc<dyn RefreshExecutor>,
    max_backoff: Duration,
    max_retries: u32,
) {
    let mut entries: HashMap<String, Entry> = HashMap::new();

    fn arm_timer(
        commands: &mpsc::Sender<Command>,
        server: &str,
        generation: u64,
        delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let commands = commands.clone();
        let server = server.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Fire { server, generation }).await;
        })
    }

    while let Some(command) = rx.recv().await {
        match command {
            Command::Enable { server, tokens } => {
                if tokens.refresh_token.is_none() {
                    continue;
                }
                let generation = entries
                    .get(&server)
                    .map(|e| e.generation + 1)
                    .unwrap_or(0);
                if let Some(old) = entries.remove(&server) {
                    if let Some(timer) = old.timer {
                        timer.abort();
                    }
                }

                let delay = schedule_delay(&tokens, Utc::now());
                let at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                states
                    .write()
                    .await
                    .insert(server.clone(), RefreshState::Scheduled { at });

                let timer = arm_timer(&commands, &server, generation, delay);
                entries.insert(
                    server,
                    Entry {
                        tokens,
                        retry_count: 0,
                        generation,
                        timer: Some(timer),
                    },
                );
            }

            Command::Disable { server } => {
                if let Some(entry) = entries.remove(&server) {
                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                }
                states
                    .write()
                    .await
                    .insert(server, RefreshState::Disabled);
            }

            Command::Now { server } => {
                let Some(entry) = entries.get_mut(&server) else {
                    continue;
                };
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                let generation = entry.generation;
                let _ = commands.send(Command::Fire { server, generation }).await;
            }

            Command::Fire { server, generation } => {
                let Some(entry) = entries.get_mut(&server) else {
                    continue;
                };
                if entry.generation != generation {
                    continue; // Stale timer from before a re-enable
                }

                states
                    .write()
                    .await
                    .insert(server.clone(), RefreshState::Refreshing);

                match executor.refresh(&server).await {
                    Ok(tokens) => {
                        entry.retry_count = 0;
                        entry.tokens = tokens;
                        let delay = schedule_delay(&entry.tokens, Utc::now());
                        let at =
                            Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                        states
                            .write()
                            .await
                            .insert(server.clone(), RefreshState::Scheduled { at });
                        entry.timer = Some(arm_timer(&commands, &server, generation, delay));
                        let _ = events_tx.send(RefreshEvent::Refreshed {
                            server: server.clone(),
                        });
                    }
                    Err(e) => {
                        let class = e.class();
                        let terminal = class == AuthErrorClass::Terminal
                            || entry.retry_count + 1 >= max_retries;

                        if terminal {
                            tracing::error!(server = %server, error = %e, "Refresh failed terminally");
                            states.write().await.insert(
                                server.clone(),
                                RefreshState::Failed {
                                    error: e.to_string(),
                                },
                            );
                            let _ = events_tx.send(RefreshEvent::RefreshFailed {
                                server: server.clone(),
                                error: e.to_string(),
                                terminal: true,
                            });
                            if let Some(timer) = entry.timer.take() {
                                timer.abort();
                            }
                            entries.remove(&server);
                        } else {
                            entry.retry_count += 1;
                            let delay = calculate_backoff(
                                entry.retry_count,
                                Duration::from_secs(1),
                                max_backoff,
                            );
                            let at = Utc::now()
                                + ChronoDuration::from_std(delay).unwrap_or_default();
                            tracing::warn!(
                                server = %server,
                                error = %e,
                                retry = entry.retry_count,
                                delay_secs = delay.as_secs(),
                                "Refresh failed, backing off"
                            );
                            states.write().await.insert(
                                server.clone(),
                                RefreshState::Backoff {
                                    retry_count: entry.retry_count,
                                    at,
                                },
                            );
                            entry.timer =
                                Some(arm_timer(&commands, &server, generation, delay));
                            let _ = events_tx.send(RefreshEvent::RefreshFailed {
                                server: server.clone(),
                                error: e.to_string(),
                                terminal: false,
                            });
                        }
                    }
                }
            }

            Command::Shutdown => {
                for (_, entry) in entries.drain() {
                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use parking_lot::Mutex;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        assert_eq!(calculate_backoff(0, base, max), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3, base, max), Duration::from_secs(8));
        assert_eq!(calculate_backoff(8, base, max), Duration::from_secs(256));
        assert_eq!(calculate_backoff(9, base, max), max);
    }

    #[test]
    fn test_backoff_never_zero_for_large_retry_counts() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        // The regression this guards: an uncapped shift wraps at 64 and
        // yields a zero delay, spinning the scheduler.
        assert_eq!(calculate_backoff(64, base, max), max);
        assert_eq!(calculate_backoff(23_158_728, base, max), max);
        for retry in 0..10_000u32 {
            let delay = calculate_backoff(retry, base, max);
            assert!(delay > Duration::ZERO);
            assert!(delay <= max);
        }
    }

    #[test]
    fn test_schedule_delay_two_thirds_of_lifetime() {
        let issued = Utc::now();
        let tokens = TokenSet {
            server_name: "gh".into(),
            auth_server_url: "https://auth.example.com".into(),
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(issued + ChronoDuration::seconds(3600)),
            issued_at: issued,
            scope: None,
            client_id: "c".into(),
            resource: None,
        };
        let delay = schedule_delay(&tokens, issued);
        assert!(delay >= Duration::from_secs(2399) && delay <= Duration::from_secs(2401));
    }

    #[test]
    fn test_schedule_delay_clamped_to_minimum() {
        let issued = Utc::now() - ChronoDuration::seconds(7200);
        let tokens = TokenSet {
            server_name: "gh".into(),
            auth_server_url: "https://auth.example.com".into(),
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(issued + ChronoDuration::seconds(3600)),
            issued_at: issued,
            scope: None,
            client_id: "c".into(),
            resource: None,
        };
        assert_eq!(schedule_delay(&tokens, Utc::now()), MIN_REFRESH_INTERVAL);
    }

    struct FailingExecutor {
        calls: Mutex<u32>,
        error: fn() -> AuthError,
    }

    #[async_trait]
    impl RefreshExecutor for FailingExecutor {
        async fn refresh(&self, _server: &str) -> AuthResult<TokenSet> {
            *self.calls.lock() += 1;
            Err((self.error)())
        }
    }

    fn short_lived_tokens() -> TokenSet {
        let issued = Utc::now();
        TokenSet {
            server_name: "gh".into(),
            auth_server_url: "https://auth.example.com".into(),
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(issued + ChronoDuration::seconds(1)),
            issued_at: issued,
            scope: None,
            client_id: "c".into(),
            resource: None,
        }
    }

    #[tokio::test]
    async fn test_terminal_error_opens_circuit_on_first_attempt() {
        let executor = Arc::new(FailingExecutor {
            calls: Mutex::new(0),
            error: || AuthError::OAuth {
                error: "invalid_grant".into(),
                description: String::new(),
            },
        });
        let manager = RefreshManager::spawn_with_limits(
            executor.clone(),
            Duration::from_secs(300),
            50,
        );
        let mut events = manager.subscribe();

        manager.enable(short_lived_tokens()).await;
        manager.refresh_now("gh").await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            RefreshEvent::RefreshFailed { terminal: true, .. }
        ));
        assert_eq!(*executor.calls.lock(), 1);
        assert!(matches!(
            manager.state("gh").await,
            Some(RefreshState::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_tokens_without_refresh_token_are_ignored() {
        let executor = Arc::new(FailingExecutor {
            calls: Mutex::new(0),
            error: || AuthError::Network("x".into()),
        });
        let manager = RefreshManager::spawn(executor);

        let mut tokens = short_lived_tokens();
        tokens.refresh_token = None;
        manager.enable(tokens).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.state("gh").await.is_none());
    }
}
