use super::types::{RegistryEvent, ServerDescriptor};
use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::info;

/// Static service registry, read from a TOML file.
///
/// Stands in for a live registry backend: each reload is turned into the
/// registry events a backend would have pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRegistry {
    #[serde(default)]
    pub apps: Vec<AppEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

impl StaticRegistry {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            if app.name.trim().is_empty() {
                return Err(PoolError::Config("registry app name cannot be empty".into()));
            }
            if !seen.insert(app.name.as_str()) {
                return Err(PoolError::Config(format!(
                    "Duplicate registry app: {}",
                    app.name
                )));
            }

            let mut endpoints = HashSet::new();
            for server in &app.servers {
                if server.host.trim().is_empty() {
                    return Err(PoolError::Config(format!(
                        "app {}: server host cannot be empty",
                        app.name
                    )));
                }
                if server.port == 0 {
                    return Err(PoolError::Config(format!(
                        "app {}: server {} has port 0",
                        app.name, server.host
                    )));
                }
                if !endpoints.insert(server.endpoint()) {
                    return Err(PoolError::Config(format!(
                        "app {}: duplicate server {}",
                        app.name,
                        server.endpoint()
                    )));
                }
            }
        }
        Ok(())
    }

    /// One full-set event per app, used for the initial load.
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.apps
            .iter()
            .filter(|app| !app.servers.is_empty())
            .map(|app| RegistryEvent::FullSet {
                app_name: app.name.clone(),
                servers: app.servers.clone(),
            })
            .collect()
    }

    /// Events that turn `self` into `next`.
    ///
    /// Apps seen for the first time get a full set; within a known app servers
    /// are diffed by endpoint into add, update and remove events.
    pub fn diff(&self, next: &StaticRegistry) -> Vec<RegistryEvent> {
        let current = self.by_app();
        let upcoming = next.by_app();
        let mut events = Vec::new();

        for (name, servers) in &upcoming {
            let Some(known) = current.get(name) else {
                if !servers.is_empty() {
                    events.push(RegistryEvent::FullSet {
                        app_name: (*name).to_string(),
                        servers: servers.to_vec(),
                    });
                }
                continue;
            };

            let mut added = Vec::new();
            let mut updated = Vec::new();
            for server in servers.iter() {
                match known.iter().find(|k| k.endpoint() == server.endpoint()) {
                    None => added.push(server.clone()),
                    Some(previous) if previous != server => updated.push(server.clone()),
                    Some(_) => {}
                }
            }
            let removed: Vec<ServerDescriptor> = known
                .iter()
                .filter(|k| !servers.iter().any(|s| s.endpoint() == k.endpoint()))
                .cloned()
                .collect();

            if !added.is_empty() {
                events.push(RegistryEvent::Add {
                    app_name: (*name).to_string(),
                    servers: added,
                });
            }
            if !updated.is_empty() {
                events.push(RegistryEvent::Update {
                    app_name: (*name).to_string(),
                    servers: updated,
                });
            }
            if !removed.is_empty() {
                events.push(RegistryEvent::Remove {
                    app_name: (*name).to_string(),
                    servers: removed,
                });
            }
        }

        for (name, servers) in &current {
            if !upcoming.contains_key(name) && !servers.is_empty() {
                events.push(RegistryEvent::Remove {
                    app_name: (*name).to_string(),
                    servers: servers.to_vec(),
                });
            }
        }

        events
    }

    fn by_app(&self) -> BTreeMap<&str, &[ServerDescriptor]> {
        self.apps
            .iter()
            .map(|app| (app.name.as_str(), app.servers.as_slice()))
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.apps.iter().map(|app| app.servers.len()).sum()
    }
}

/// Load a static registry from a TOML file.
pub fn load_registry<P: AsRef<Path>>(path: P) -> Result<StaticRegistry> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        PoolError::Config(format!(
            "Failed to read registry file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let registry: StaticRegistry = toml::from_str(&content)
        .map_err(|e| PoolError::Config(format!("Failed to parse registry file: {}", e)))?;

    registry.validate()?;

    info!(
        apps = registry.apps.len(),
        servers = registry.server_count(),
        "Service registry loaded"
    );

    Ok(registry)
}

/// Write an example registry file.
pub fn create_example_registry<P: AsRef<Path>>(path: P) -> Result<()> {
    let example = r#"# meshpool static service registry

[[apps]]
name = "order-service"

  [[apps.servers]]
  protocol = "nova"
  namespace = "com.example.order"
  host = "10.0.0.11"
  port = 8050
  weight = 100
  idc = "dc1"

    [[apps.servers.services]]
    service = "com.example.order.OrderService"
    methods = ["create", "get", "cancel"]

  [[apps.servers]]
  protocol = "nova"
  namespace = "com.example.order"
  host = "10.0.1.11"
  port = 8050
  weight = 50
  idc = "dc2"

    [[apps.servers.services]]
    service = "com.example.order.OrderService"
    methods = ["create", "get", "cancel"]

[[apps]]
name = "user-service"

  [[apps.servers]]
  protocol = "dubbo"
  namespace = "com.example.user"
  host = "10.0.0.21"
  port = 20880

    [[apps.servers.services]]
    service = "com.example.user.UserService"
    methods = ["profile"]
"#;

    std::fs::write(path.as_ref(), example)
        .map_err(|e| PoolError::Config(format!("Failed to write example registry: {}", e)))?;

    info!(path = ?path.as_ref(), "Example registry file created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::ServiceEntry;
    use tempfile::NamedTempFile;

    fn server(host: &str, weight: Option<u32>) -> ServerDescriptor {
        ServerDescriptor {
            protocol: "nova".to_string(),
            namespace: "ns".to_string(),
            host: host.to_string(),
            port: 8050,
            weight,
            idc: None,
            services: vec![ServiceEntry {
                service: "svc".to_string(),
                methods: vec!["m".to_string()],
            }],
        }
    }

    fn registry(apps: Vec<(&str, Vec<ServerDescriptor>)>) -> StaticRegistry {
        StaticRegistry {
            apps: apps
                .into_iter()
                .map(|(name, servers)| AppEntry {
                    name: name.to_string(),
                    servers,
                })
                .collect(),
        }
    }

    #[test]
    fn example_registry_loads() {
        let file = NamedTempFile::new().unwrap();
        create_example_registry(file.path()).unwrap();

        let loaded = load_registry(file.path()).unwrap();
        assert_eq!(loaded.apps.len(), 2);
        assert_eq!(loaded.server_count(), 3);
        assert_eq!(loaded.events().len(), 2);
    }

    #[test]
    fn duplicate_endpoint_is_rejected() {
        let bad = registry(vec![("app", vec![server("a", None), server("a", Some(5))])]);
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate server"));
    }

    #[test]
    fn diff_splits_add_update_remove() {
        let before = registry(vec![("app", vec![server("a", None), server("b", None)])]);
        let after = registry(vec![(
            "app",
            vec![server("b", Some(10)), server("c", None)],
        )]);

        let events = before.diff(&after);
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["add", "update", "remove"]);
        assert_eq!(events[0].servers()[0].host, "c");
        assert_eq!(events[1].servers()[0].weight, Some(10));
        assert_eq!(events[2].servers()[0].host, "a");
    }

    #[test]
    fn diff_handles_new_and_dropped_apps() {
        let before = registry(vec![("old", vec![server("a", None)])]);
        let after = registry(vec![("new", vec![server("b", None)])]);

        let events = before.diff(&after);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RegistryEvent::FullSet { app_name, .. } if app_name == "new"));
        assert!(matches!(&events[1], RegistryEvent::Remove { app_name, .. } if app_name == "old"));
    }

    #[test]
    fn unchanged_registry_has_no_events() {
        let reg = registry(vec![("app", vec![server("a", None)])]);
        assert!(reg.diff(&reg.clone()).is_empty());
    }
}
