use crate::config::{ConnectionSettings, FramingConfig};
use crate::registry::{Endpoint, ServerDescriptor};
use std::time::Duration;

pub const DEFAULT_WEIGHT: u32 = 100;

/// Everything needed to open and maintain one connection.
///
/// Built by layering a registry server over the protocol defaults; server
/// fields win where present.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub endpoint: Endpoint,
    pub protocol: String,
    pub namespace: String,
    pub weight: u32,
    pub idc: Option<String>,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub persistent: bool,
    pub framing: FramingConfig,
    /// The registry entry this config came from.
    pub server: ServerDescriptor,
}

impl EndpointConfig {
    pub fn from_server(server: &ServerDescriptor, settings: &ConnectionSettings) -> Self {
        let defaults = settings.defaults_for(&server.protocol);
        Self {
            endpoint: server.endpoint(),
            protocol: server.protocol.clone(),
            namespace: server.namespace.clone(),
            weight: server.weight.unwrap_or(DEFAULT_WEIGHT),
            idc: server.idc.clone(),
            timeout: Duration::from_millis(defaults.timeout_ms),
            heartbeat_interval: Duration::from_millis(defaults.heartbeat_interval_ms),
            connect_timeout: Duration::from_millis(defaults.connect_timeout_ms),
            persistent: defaults.persistent,
            framing: defaults.framing.clone(),
            server: server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(protocol: &str) -> ServerDescriptor {
        ServerDescriptor {
            protocol: protocol.to_string(),
            namespace: "ns".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8050,
            weight: None,
            idc: Some("dc1".to_string()),
            services: Vec::new(),
        }
    }

    #[test]
    fn server_fields_layer_over_protocol_defaults() {
        let settings = ConnectionSettings::default();

        let nova = EndpointConfig::from_server(&server("nova"), &settings);
        assert_eq!(nova.weight, DEFAULT_WEIGHT);
        assert_eq!(nova.idc.as_deref(), Some("dc1"));
        assert_eq!(
            nova.heartbeat_interval,
            Duration::from_millis(settings.nova.heartbeat_interval_ms)
        );

        let mut weighted = server("dubbo");
        weighted.weight = Some(7);
        let dubbo = EndpointConfig::from_server(&weighted, &settings);
        assert_eq!(dubbo.weight, 7);
        assert_eq!(dubbo.timeout, Duration::from_millis(5000));
        assert_eq!(dubbo.heartbeat_interval, Duration::from_millis(30000));
        assert_eq!(dubbo.server, weighted);
    }
}
