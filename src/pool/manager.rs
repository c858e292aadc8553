use super::app_pool::AppPool;
use super::connection::Connection;
use super::context::CallContext;
use super::endpoint::EndpointConfig;
use super::metrics::{self, PoolMetrics};
use super::stats::PoolStats;
use super::{PoolRuntime, WaitKey};
use crate::balance::{LoadBalancer, StrategyRegistry};
use crate::config::{Config, ConnectionSettings};
use crate::registry::{
    InMemoryServiceStore, RegistryEvent, ServerDescriptor, ServiceDescriptor, ServiceKey,
    ServiceStore,
};
use crate::transport::{Heartbeat, HeartbeatRegistry, TcpTransport, Transport};
use crate::utils::error::{PoolError, Result};
use crate::utils::Condition;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Process-wide entry point: service catalog plus one [`AppPool`] per application.
///
/// Registry events keep both up to date; [`lookup`](Self::lookup) resolves a
/// call to a connection.
pub struct ConnectionManager {
    catalog: DashMap<ServiceKey, ServiceDescriptor>,
    pools: DashMap<String, Arc<AppPool>>,
    runtime: Arc<PoolRuntime>,
    connection_settings: ConnectionSettings,
    strategies: StrategyRegistry,
    /// Store fed from applied events when no external store was supplied.
    mirror: Option<Arc<InMemoryServiceStore>>,
}

pub struct ConnectionManagerBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    service_store: Option<Arc<dyn ServiceStore>>,
    heartbeats: HeartbeatRegistry,
    strategies: StrategyRegistry,
}

impl ConnectionManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            service_store: None,
            heartbeats: HeartbeatRegistry::new(),
            strategies: StrategyRegistry::with_defaults(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use an external service store for reconnect decisions.
    ///
    /// Without one the manager keeps its own store in sync with applied events.
    pub fn service_store(mut self, store: Arc<dyn ServiceStore>) -> Self {
        self.service_store = Some(store);
        self
    }

    pub fn heartbeat(mut self, protocol: &str, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeats.register(protocol, heartbeat);
        self
    }

    pub fn strategy<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn LoadBalancer> + Send + Sync + 'static,
    {
        self.strategies.register(name, factory);
        self
    }

    pub fn build(self) -> Result<Arc<ConnectionManager>> {
        self.config.validate()?;
        metrics::init();

        let mut mirror = None;
        let service_store = match self.service_store {
            Some(store) => store,
            None => {
                let store = Arc::new(InMemoryServiceStore::new());
                mirror = Some(store.clone());
                store as Arc<dyn ServiceStore>
            }
        };

        let runtime = Arc::new(PoolRuntime {
            settings: self.config.pool.clone(),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(TcpTransport::new()) as Arc<dyn Transport>),
            heartbeats: Arc::new(self.heartbeats),
            service_store,
            conditions: Arc::new(Condition::new()),
        });

        info!(
            run_mode = ?self.config.pool.run_mode,
            idc = ?self.config.pool.idc,
            strategies = ?self.strategies.names(),
            "Connection manager ready"
        );

        Ok(Arc::new(ConnectionManager {
            catalog: DashMap::new(),
            pools: DashMap::new(),
            runtime,
            connection_settings: self.config.connection,
            strategies: self.strategies,
            mirror,
        }))
    }
}

impl ConnectionManager {
    pub fn builder(config: Config) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new(config)
    }

    /// Resolve a call to a live connection.
    ///
    /// Waits up to the lookup timeout for the service to be registered, then
    /// delegates to the owning pool. `Ok(None)` means the pool had no active
    /// connection within the empty-pool timeout.
    #[instrument(level = "debug", skip(self, ctx))]
    pub async fn lookup(
        &self,
        protocol: &str,
        domain: &str,
        service: &str,
        method: &str,
        ctx: &mut CallContext,
    ) -> Result<Option<Arc<Connection>>> {
        let key = ServiceKey::new(protocol, service);
        let Some(descriptor) = self.wait_for_service(&key).await else {
            warn!(protocol, domain, service, method, "Service not found");
            PoolMetrics::lookup_failed("service_not_found");
            return Err(PoolError::ServiceNotFound {
                protocol: protocol.to_string(),
                domain: domain.to_string(),
                service: service.to_string(),
                method: method.to_string(),
            });
        };

        if !descriptor.has_method(method) {
            warn!(service, method, "Method not found");
            PoolMetrics::lookup_failed("method_not_found");
            return Err(PoolError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            });
        }

        let pool = self.pool(&descriptor.app_name)?;
        ctx.annotate(&descriptor.app_name, protocol, domain, service, method);
        pool.get(ctx).await
    }

    async fn wait_for_service(&self, key: &ServiceKey) -> Option<ServiceDescriptor> {
        let deadline = Instant::now() + self.runtime.settings.lookup_timeout();
        let wait_key = WaitKey::Service(key.clone());

        loop {
            let mut waiter = self.runtime.conditions.subscribe(&wait_key);
            if let Some(descriptor) = self.catalog.get(key) {
                return Some(descriptor.value().clone());
            }
            debug!(service = %key, "Waiting for service registration");
            if waiter.wait(deadline).await.is_err() {
                return None;
            }
        }
    }

    /// Apply any registry event.
    pub async fn apply(&self, event: RegistryEvent) -> Result<()> {
        debug!(
            app = event.app_name(),
            kind = event.kind(),
            servers = event.servers().len(),
            "Applying registry event"
        );
        match event {
            RegistryEvent::FullSet { app_name, servers } => {
                self.apply_full_set(&app_name, servers).await.map(|_| ())
            }
            RegistryEvent::Add { app_name, servers } => self.apply_add(&app_name, &servers).await,
            RegistryEvent::Update { app_name, servers } => {
                self.apply_update(&app_name, &servers).await
            }
            RegistryEvent::Remove { app_name, servers } => {
                self.apply_remove(&app_name, &servers).await
            }
        }
    }

    /// Feed registry events from a channel until it closes.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let app = event.app_name().to_string();
                let kind = event.kind();
                if let Err(e) = manager.apply(event).await {
                    warn!(app = %app, kind, error = %e, "Failed to apply registry event");
                }
            }
            debug!("Registry event channel closed");
        })
    }

    /// Replace an application's endpoints and rebuild its pool.
    ///
    /// The previous pool, if any, is shut down without reconnecting.
    pub async fn apply_full_set(
        &self,
        app_name: &str,
        servers: Vec<ServerDescriptor>,
    ) -> Result<Arc<AppPool>> {
        let strategy = self.strategy_for(&servers);
        if !self.strategies.contains(&strategy) {
            return Err(PoolError::StrategyNotFound(strategy));
        }
        // The store must list the servers before the first dial can fail and ask to reconnect.
        if let Some(mirror) = &self.mirror {
            mirror.set(app_name, servers.clone());
        }

        let configs: Vec<EndpointConfig> = servers
            .iter()
            .map(|server| EndpointConfig::from_server(server, &self.connection_settings))
            .collect();
        let pool = AppPool::build(
            app_name,
            configs,
            &strategy,
            &self.strategies,
            self.runtime.clone(),
        )
        .await?;

        if let Some(previous) = self.pools.insert(app_name.to_string(), pool.clone()) {
            previous.shutdown().await;
        }

        let mut keys = HashSet::new();
        for server in &servers {
            keys.extend(self.upsert_catalog(app_name, server));
        }
        self.catalog
            .retain(|key, descriptor| descriptor.app_name != app_name || keys.contains(key));

        for key in &keys {
            self.runtime.conditions.wake(&WaitKey::Service(key.clone()));
        }

        info!(
            app = app_name,
            servers = servers.len(),
            services = keys.len(),
            strategy = %strategy,
            "Applied full endpoint set"
        );
        Ok(pool)
    }

    /// Bring new endpoints online.
    pub async fn apply_add(&self, app_name: &str, servers: &[ServerDescriptor]) -> Result<()> {
        let Some(pool) = self.pool_or_build(app_name, servers).await? else {
            return Ok(());
        };
        if let Some(mirror) = &self.mirror {
            mirror.upsert(app_name, servers);
        }

        for server in servers {
            info!(app = app_name, server = %server.describe(), "Endpoint online");
            let keys = self.upsert_catalog(app_name, server);
            let config = pool
                .add_config(EndpointConfig::from_server(server, &self.connection_settings))
                .await;
            if pool.connection_for(&config.endpoint).await.is_none() {
                pool.create_connection(config).await;
            }
            for key in keys {
                self.runtime.conditions.wake(&WaitKey::Service(key));
            }
        }

        pool.refresh_strategy().await;
        Ok(())
    }

    /// Record changed endpoint metadata. Existing connections are left alone.
    pub async fn apply_update(&self, app_name: &str, servers: &[ServerDescriptor]) -> Result<()> {
        let Some(pool) = self.pool_or_build(app_name, servers).await? else {
            return Ok(());
        };
        if let Some(mirror) = &self.mirror {
            mirror.upsert(app_name, servers);
        }

        for server in servers {
            info!(app = app_name, server = %server.describe(), "Endpoint updated");
            let keys = self.upsert_catalog(app_name, server);
            pool.add_config(EndpointConfig::from_server(server, &self.connection_settings))
                .await;
            for key in keys {
                self.runtime.conditions.wake(&WaitKey::Service(key));
            }
        }

        pool.refresh_strategy().await;
        Ok(())
    }

    /// Take endpoints offline.
    ///
    /// Their connections are closed without reconnecting. Once the app has no
    /// endpoint left its services leave the catalog.
    pub async fn apply_remove(&self, app_name: &str, servers: &[ServerDescriptor]) -> Result<()> {
        let pool = self.pool(app_name)?;
        if let Some(mirror) = &self.mirror {
            mirror.remove(app_name, servers);
        }

        for server in servers {
            info!(app = app_name, server = %server.describe(), "Endpoint offline");
            let endpoint = server.endpoint();
            pool.remove_config(&endpoint).await;
            while let Some(connection) = pool.connection_for(&endpoint).await {
                pool.remove(&connection).await;
                connection.retire().await;
            }
        }
        pool.refresh_strategy().await;

        if pool.config_count().await == 0 {
            let before = self.catalog.len();
            self.catalog.retain(|_, descriptor| descriptor.app_name != app_name);
            info!(
                app = app_name,
                services = before - self.catalog.len(),
                "App has no endpoints left, services unregistered"
            );
        }
        Ok(())
    }

    /// Existing pool, or a freshly built one when the app is unknown.
    ///
    /// Returns `None` when the pool was just built from `servers`, since that
    /// already applied them.
    async fn pool_or_build(
        &self,
        app_name: &str,
        servers: &[ServerDescriptor],
    ) -> Result<Option<Arc<AppPool>>> {
        if let Some(pool) = self.pools.get(app_name) {
            return Ok(Some(pool.value().clone()));
        }
        if servers.is_empty() {
            return Err(PoolError::PoolNotFound(app_name.to_string()));
        }

        debug!(app = app_name, "No pool yet, building from event");
        self.apply_full_set(app_name, servers.to_vec()).await?;
        Ok(None)
    }

    fn upsert_catalog(&self, app_name: &str, server: &ServerDescriptor) -> Vec<ServiceKey> {
        server
            .services
            .iter()
            .map(|entry| {
                let descriptor = ServiceDescriptor::from_server(app_name, server, entry);
                let key = descriptor.key();
                self.catalog.insert(key.clone(), descriptor);
                key
            })
            .collect()
    }

    fn strategy_for(&self, servers: &[ServerDescriptor]) -> String {
        let protocol = servers
            .first()
            .map(|server| server.protocol.as_str())
            .unwrap_or("nova");
        self.connection_settings
            .defaults_for(protocol)
            .load_balancing_strategy
            .clone()
    }

    pub fn pool(&self, app_name: &str) -> Result<Arc<AppPool>> {
        self.pools
            .get(app_name)
            .map(|pool| pool.value().clone())
            .ok_or_else(|| PoolError::PoolNotFound(app_name.to_string()))
    }

    pub fn service(&self, protocol: &str, service: &str) -> Option<ServiceDescriptor> {
        self.catalog
            .get(&ServiceKey::new(protocol, service))
            .map(|descriptor| descriptor.value().clone())
    }

    /// Current registry view of an app, keyed by `host:port`.
    pub async fn endpoints_for(&self, app_name: &str) -> BTreeMap<String, ServerDescriptor> {
        let Ok(pool) = self.pool(app_name) else {
            return BTreeMap::new();
        };
        pool.configs()
            .await
            .into_iter()
            .map(|config| (config.endpoint.to_string(), config.server.clone()))
            .collect()
    }

    pub fn app_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|pool| pool.key().clone()).collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<AppPool>> = self.pools.iter().map(|pool| pool.value().clone()).collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.stats().await);
        }
        stats.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        stats
    }

    /// Shut every pool down and forget all services.
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<AppPool>> = self.pools.iter().map(|pool| pool.value().clone()).collect();
        self.pools.clear();
        self.catalog.clear();
        join_all(pools.iter().map(|pool| pool.shutdown())).await;
        info!("Connection manager shut down");
    }
}
