//! Service chain routing: endpoints reserved for a named traffic lane.
//!
//! A chain router tags some endpoints of an app with a chain key. Calls that
//! carry the key are pinned to those endpoints; calls without it must avoid
//! every tagged endpoint.

use crate::utils::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

/// Free-form metadata attached to a chain endpoint.
pub type EndpointMetadata = HashMap<String, String>;

/// Source of service-chain endpoint assignments. Endpoints are `host:port` strings.
#[async_trait]
pub trait ServiceChainer: Send + Sync {
    /// Every endpoint of `app_name` that belongs to any chain.
    async fn endpoints(&self, app_name: &str) -> Result<HashMap<String, EndpointMetadata>>;

    /// Endpoints of `app_name` tagged with `key`.
    async fn endpoints_for_key(
        &self,
        app_name: &str,
        key: &str,
    ) -> Result<HashMap<String, EndpointMetadata>>;
}

/// Chain assignments held in memory.
#[derive(Debug, Default)]
pub struct StaticServiceChain {
    // app -> chain key -> endpoint -> metadata
    routes: DashMap<String, HashMap<String, HashMap<String, EndpointMetadata>>>,
}

impl StaticServiceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, app_name: &str, key: &str, endpoint: &str, metadata: EndpointMetadata) {
        self.routes
            .entry(app_name.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(endpoint.to_string(), metadata);
    }

    pub fn unassign(&self, app_name: &str, key: &str, endpoint: &str) {
        if let Some(mut chains) = self.routes.get_mut(app_name) {
            if let Some(endpoints) = chains.get_mut(key) {
                endpoints.remove(endpoint);
                if endpoints.is_empty() {
                    chains.remove(key);
                }
            }
        }
    }
}

#[async_trait]
impl ServiceChainer for StaticServiceChain {
    async fn endpoints(&self, app_name: &str) -> Result<HashMap<String, EndpointMetadata>> {
        let mut merged = HashMap::new();
        if let Some(chains) = self.routes.get(app_name) {
            for endpoints in chains.values() {
                for (endpoint, metadata) in endpoints {
                    merged.insert(endpoint.clone(), metadata.clone());
                }
            }
        }
        Ok(merged)
    }

    async fn endpoints_for_key(
        &self,
        app_name: &str,
        key: &str,
    ) -> Result<HashMap<String, EndpointMetadata>> {
        Ok(self
            .routes
            .get(app_name)
            .and_then(|chains| chains.get(key).cloned())
            .unwrap_or_default())
    }
}
