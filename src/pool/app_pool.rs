use super::backoff::Backoff;
use super::connection::{Connection, ConnectionId};
use super::context::CallContext;
use super::endpoint::EndpointConfig;
use super::metrics::PoolMetrics;
use super::selection::{chain_candidates, prefer_local, ChainMatch};
use super::stats::{ConnectionInfo, PoolStats};
use super::{PoolRuntime, WaitKey};
use crate::balance::{LoadBalancer, StrategyRegistry};
use crate::config::RunMode;
use crate::registry::Endpoint;
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PoolState {
    configs: BTreeMap<Endpoint, Arc<EndpointConfig>>,
    pending: BTreeMap<ConnectionId, Arc<Connection>>,
    active: BTreeMap<ConnectionId, Arc<Connection>>,
    backoff: Backoff,
}

/// All connections to one application's endpoints.
///
/// A live connection is either pending (dialling) or active (eligible for
/// selection), never both. Closed connections are in neither.
pub struct AppPool {
    id: Uuid,
    app_name: String,
    strategy_name: String,
    strategy: Arc<dyn LoadBalancer>,
    state: Mutex<PoolState>,
    runtime: Arc<PoolRuntime>,
    this: Weak<AppPool>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    created_at: DateTime<Utc>,
}

impl AppPool {
    /// Build a pool and start one connection per endpoint.
    ///
    /// Fails with `StrategyNotFound` before dialling anything.
    pub(crate) async fn build(
        app_name: &str,
        configs: Vec<EndpointConfig>,
        strategy_name: &str,
        strategies: &StrategyRegistry,
        runtime: Arc<PoolRuntime>,
    ) -> Result<Arc<Self>> {
        let strategy = strategies.create(strategy_name)?;
        let backoff = Backoff::new(
            Duration::from_millis(runtime.settings.reload_step_ms),
            Duration::from_millis(runtime.settings.reload_max_ms),
        );
        let configs: BTreeMap<Endpoint, Arc<EndpointConfig>> = configs
            .into_iter()
            .map(|config| (config.endpoint.clone(), Arc::new(config)))
            .collect();
        let initial: Vec<Arc<EndpointConfig>> = configs.values().cloned().collect();

        let pool = Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            app_name: app_name.to_string(),
            strategy_name: strategy_name.to_string(),
            strategy,
            state: Mutex::new(PoolState {
                configs,
                pending: BTreeMap::new(),
                active: BTreeMap::new(),
                backoff,
            }),
            runtime,
            this: this.clone(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            created_at: Utc::now(),
        });

        info!(
            app = %pool.app_name,
            pool_id = %pool.id,
            endpoints = initial.len(),
            strategy = strategy_name,
            "App pool created"
        );

        for config in initial {
            pool.create_connection(config).await;
        }
        Ok(pool)
    }

    /// Start a new pending connection to `config`'s endpoint.
    pub async fn create_connection(&self, config: Arc<EndpointConfig>) -> Option<Arc<Connection>> {
        if self.is_shut_down() {
            return None;
        }

        let connection = Connection::new(
            config,
            self.this.clone(),
            self.runtime.heartbeats.clone(),
            self.cancel.child_token(),
        );
        self.state
            .lock()
            .await
            .pending
            .insert(connection.id(), connection.clone());
        PoolMetrics::connection_pending(&self.app_name);

        debug!(
            app = %self.app_name,
            conn_id = %connection.id(),
            endpoint = %connection.endpoint(),
            "Connection created"
        );
        connection.connect(self.runtime.transport.clone());
        Some(connection)
    }

    /// Promote a pending connection that just established its socket.
    pub(crate) async fn connected(&self, connection: &Arc<Connection>) {
        let active = {
            let mut state = self.state.lock().await;
            state.backoff.reset(connection.endpoint());

            if state.pending.remove(&connection.id()).is_none() {
                return;
            }
            PoolMetrics::connection_left_pending(&self.app_name);

            if connection.is_closed() {
                return;
            }
            state.active.insert(connection.id(), connection.clone());
            PoolMetrics::connection_active(&self.app_name);
            state.active.values().cloned().collect::<Vec<_>>()
        };

        self.strategy.refresh(&active).await;
        let woken = self.runtime.conditions.wake(&WaitKey::Pool(self.id));
        debug!(
            app = %self.app_name,
            conn_id = %connection.id(),
            active = active.len(),
            woken,
            "Connection active"
        );
    }

    /// Forget a connection. Returns whether it was a member.
    pub async fn remove(&self, connection: &Connection) -> bool {
        let (removed, active) = {
            let mut state = self.state.lock().await;
            let was_pending = state.pending.remove(&connection.id()).is_some();
            if was_pending {
                PoolMetrics::connection_left_pending(&self.app_name);
            }
            let was_active = state.active.remove(&connection.id()).is_some();
            if was_active {
                PoolMetrics::connection_left_active(&self.app_name);
            }
            let active = was_active.then(|| state.active.values().cloned().collect::<Vec<_>>());
            (was_pending || was_active, active)
        };

        if let Some(active) = active {
            self.strategy.refresh(&active).await;
        }
        removed
    }

    /// Schedule a reconnect to an endpoint whose connection closed.
    ///
    /// The first retry after a success is immediate; each further retry waits
    /// one backoff step longer, up to the cap.
    pub async fn reload(&self, config: Arc<EndpointConfig>) {
        if self.is_shut_down() {
            debug!(app = %self.app_name, endpoint = %config.endpoint, "Pool shut down, not reconnecting");
            return;
        }
        if !self.can_reload(&config).await {
            info!(
                app = %self.app_name,
                endpoint = %config.endpoint,
                "Endpoint no longer offered, not reconnecting"
            );
            return;
        }

        let delay = self.state.lock().await.backoff.next_delay(&config.endpoint);
        PoolMetrics::reconnect_scheduled(&self.app_name);
        info!(
            app = %self.app_name,
            endpoint = %config.endpoint,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );

        if delay.is_zero() {
            self.create_connection(config).await;
            return;
        }

        let pool = self.this.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {
                    if let Some(pool) = pool.upgrade() {
                        if pool.can_reload(&config).await {
                            pool.create_connection(config).await;
                        }
                    }
                }
            }
        });
    }

    async fn can_reload(&self, config: &EndpointConfig) -> bool {
        if !self.has_config(&config.endpoint).await {
            return false;
        }
        match self.runtime.settings.run_mode {
            RunMode::Test => true,
            RunMode::Online => self
                .runtime
                .service_store
                .is_live(&self.app_name, &config.endpoint),
        }
    }

    /// Pick a connection for a call.
    ///
    /// Waits up to the empty-pool timeout for the first active connection and
    /// returns `Ok(None)` if none shows up.
    pub async fn get(&self, ctx: &CallContext) -> Result<Option<Arc<Connection>>> {
        let deadline = Instant::now() + self.runtime.settings.empty_pool_timeout();
        let key = WaitKey::Pool(self.id);

        let active = loop {
            let mut waiter = self.runtime.conditions.subscribe(&key);
            if self.is_shut_down() {
                debug!(app = %self.app_name, "Pool was replaced during lookup");
                return Ok(None);
            }
            let active = self.active_connections().await;
            if !active.is_empty() {
                break active;
            }
            if waiter.wait(deadline).await.is_err() {
                warn!(app = %self.app_name, "No active connection before timeout");
                PoolMetrics::lookup_failed("empty_pool");
                return Ok(None);
            }
        };

        let (candidates, matched) = chain_candidates(&self.app_name, ctx, active).await?;
        let candidates = if matched == ChainMatch::Hit {
            candidates
        } else {
            prefer_local(candidates, self.runtime.settings.idc.as_deref())
        };

        self.strategy.select(&candidates).await.map(Some)
    }

    /// Close every connection and stop reconnecting. Used when the pool is replaced.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.lock().await;
            let pending = std::mem::take(&mut state.pending);
            let active = std::mem::take(&mut state.active);
            for _ in 0..pending.len() {
                PoolMetrics::connection_left_pending(&self.app_name);
            }
            for _ in 0..active.len() {
                PoolMetrics::connection_left_active(&self.app_name);
            }
            pending.into_values().chain(active.into_values()).collect()
        };

        join_all(connections.iter().map(|connection| connection.retire())).await;
        self.runtime.conditions.wake(&WaitKey::Pool(self.id));
        info!(
            app = %self.app_name,
            pool_id = %self.id,
            closed = connections.len(),
            "App pool shut down"
        );
    }

    pub async fn add_config(&self, config: EndpointConfig) -> Arc<EndpointConfig> {
        let config = Arc::new(config);
        self.state
            .lock()
            .await
            .configs
            .insert(config.endpoint.clone(), config.clone());
        config
    }

    pub async fn remove_config(&self, endpoint: &Endpoint) -> Option<Arc<EndpointConfig>> {
        let mut state = self.state.lock().await;
        state.backoff.forget(endpoint);
        state.configs.remove(endpoint)
    }

    pub async fn has_config(&self, endpoint: &Endpoint) -> bool {
        self.state.lock().await.configs.contains_key(endpoint)
    }

    pub async fn configs(&self) -> Vec<Arc<EndpointConfig>> {
        self.state.lock().await.configs.values().cloned().collect()
    }

    pub async fn config_count(&self) -> usize {
        self.state.lock().await.configs.len()
    }

    /// Live connection to an endpoint, active first, then pending.
    pub async fn connection_for(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        let state = self.state.lock().await;
        state
            .active
            .values()
            .chain(state.pending.values())
            .find(|c| c.endpoint() == endpoint)
            .cloned()
    }

    /// Let the strategy re-read the active set.
    pub async fn refresh_strategy(&self) {
        let active = self.active_connections().await;
        self.strategy.refresh(&active).await;
    }

    pub async fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().await.active.values().cloned().collect()
    }

    pub async fn pending_connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().await.pending.values().cloned().collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            app_name: self.app_name.clone(),
            pool_id: self.id,
            strategy: self.strategy_name.clone(),
            created_at: self.created_at,
            endpoints: state.configs.keys().map(|e| e.to_string()).collect(),
            active: state.active.len(),
            pending: state.pending.len(),
            connections: state
                .active
                .values()
                .chain(state.pending.values())
                .map(|c| ConnectionInfo::from(c.as_ref()))
                .collect(),
            backoff_ms: state
                .backoff
                .snapshot()
                .into_iter()
                .filter(|(_, delay)| !delay.is_zero())
                .map(|(endpoint, delay)| (endpoint.to_string(), delay.as_millis() as u64))
                .collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for AppPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AppPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppPool")
            .field("id", &self.id)
            .field("app_name", &self.app_name)
            .field("strategy", &self.strategy_name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
