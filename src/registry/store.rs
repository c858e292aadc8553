use super::types::{Endpoint, RegistryEvent, ServerDescriptor};
use dashmap::DashMap;

/// Read side of the external service store: which servers are currently live per app.
///
/// Consulted before reconnecting to an endpoint so that offlined servers are not
/// redialled forever.
pub trait ServiceStore: Send + Sync {
    fn services(&self, app_name: &str) -> Vec<ServerDescriptor>;

    fn is_live(&self, app_name: &str, endpoint: &Endpoint) -> bool {
        self.services(app_name)
            .iter()
            .any(|server| server.host == endpoint.host && server.port == endpoint.port)
    }
}

/// Service store kept in memory, fed from registry events.
#[derive(Debug, Default)]
pub struct InMemoryServiceStore {
    apps: DashMap<String, Vec<ServerDescriptor>>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all servers of an app.
    pub fn set(&self, app_name: &str, servers: Vec<ServerDescriptor>) {
        if servers.is_empty() {
            self.apps.remove(app_name);
        } else {
            self.apps.insert(app_name.to_string(), servers);
        }
    }

    /// Insert or replace servers by endpoint.
    pub fn upsert(&self, app_name: &str, servers: &[ServerDescriptor]) {
        let mut entry = self.apps.entry(app_name.to_string()).or_default();
        for server in servers {
            match entry
                .iter_mut()
                .find(|known| known.host == server.host && known.port == server.port)
            {
                Some(known) => *known = server.clone(),
                None => entry.push(server.clone()),
            }
        }
    }

    /// Drop servers by endpoint.
    pub fn remove(&self, app_name: &str, servers: &[ServerDescriptor]) {
        let now_empty = match self.apps.get_mut(app_name) {
            Some(mut entry) => {
                entry.retain(|known| {
                    !servers
                        .iter()
                        .any(|gone| gone.host == known.host && gone.port == known.port)
                });
                entry.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.apps.remove(app_name);
        }
    }

    /// Mirror a registry event into the store.
    pub fn record(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::FullSet { app_name, servers } => self.set(app_name, servers.clone()),
            RegistryEvent::Add { app_name, servers } | RegistryEvent::Update { app_name, servers } => {
                self.upsert(app_name, servers)
            }
            RegistryEvent::Remove { app_name, servers } => self.remove(app_name, servers),
        }
    }

    pub fn app_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl ServiceStore for InMemoryServiceStore {
    fn services(&self, app_name: &str) -> Vec<ServerDescriptor> {
        self.apps
            .get(app_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
