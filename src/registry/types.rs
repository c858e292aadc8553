use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Network address of one backend server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One service advertised by a server, with its callable methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// A server as announced by the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub namespace: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub idc: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

fn default_protocol() -> String {
    "nova".to_string()
}

impl ServerDescriptor {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Flat `[key=value, ...]` rendering used in lifecycle logs.
    pub fn describe(&self) -> String {
        let mut info = vec![
            format!("protocol={}", self.protocol),
            format!("namespace={}", self.namespace),
            format!("host={}", self.host),
            format!("port={}", self.port),
        ];
        if let Some(weight) = self.weight {
            info.push(format!("weight={}", weight));
        }
        if let Some(idc) = &self.idc {
            info.push(format!("idc={}", idc));
        }
        format!("[{}]", info.join(", "))
    }
}

/// Catalog key for a service.
///
/// The namespace/domain is not part of the key: callers do not know it at call time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    protocol: String,
    service: String,
}

impl ServiceKey {
    pub fn new(protocol: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            service: service.into(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.protocol, self.service)
    }
}

/// Latest known description of a service, as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub app_name: String,
    pub protocol: String,
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub idc: Option<String>,
    pub service_name: String,
    pub methods: HashSet<String>,
}

impl ServiceDescriptor {
    pub fn from_server(app_name: &str, server: &ServerDescriptor, entry: &ServiceEntry) -> Self {
        Self {
            app_name: app_name.to_string(),
            protocol: server.protocol.clone(),
            namespace: server.namespace.clone(),
            host: server.host.clone(),
            port: server.port,
            weight: server.weight.unwrap_or(crate::pool::DEFAULT_WEIGHT),
            idc: server.idc.clone(),
            service_name: entry.service.clone(),
            methods: entry.methods.iter().cloned().collect(),
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.protocol.clone(), self.service_name.clone())
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }
}

/// Change notification pushed by a registry backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Replace the whole endpoint list of an application.
    FullSet {
        app_name: String,
        servers: Vec<ServerDescriptor>,
    },
    /// New endpoints came online.
    Add {
        app_name: String,
        servers: Vec<ServerDescriptor>,
    },
    /// Existing endpoints changed metadata.
    Update {
        app_name: String,
        servers: Vec<ServerDescriptor>,
    },
    /// Endpoints went offline.
    Remove {
        app_name: String,
        servers: Vec<ServerDescriptor>,
    },
}

impl RegistryEvent {
    pub fn app_name(&self) -> &str {
        match self {
            Self::FullSet { app_name, .. }
            | Self::Add { app_name, .. }
            | Self::Update { app_name, .. }
            | Self::Remove { app_name, .. } => app_name,
        }
    }

    pub fn servers(&self) -> &[ServerDescriptor] {
        match self {
            Self::FullSet { servers, .. }
            | Self::Add { servers, .. }
            | Self::Update { servers, .. }
            | Self::Remove { servers, .. } => servers,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FullSet { .. } => "full_set",
            Self::Add { .. } => "add",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
        }
    }
}
