use crate::chain::ServiceChainer;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const APP_NAME: &str = "RPC::appName";
pub const PROTOCOL: &str = "RPC::protocol";
pub const DOMAIN: &str = "RPC::domain";
pub const SERVICE: &str = "RPC::service";
pub const METHOD: &str = "RPC::method";
/// Chain key the call should be pinned to.
pub const SERVICE_CHAIN_NAME: &str = "service-chain-name";

/// Per-call key/value context.
///
/// Carries routing hints in (service chain key, optional chain router) and is
/// annotated with the resolved call coordinates during lookup.
#[derive(Clone, Default)]
pub struct CallContext {
    values: HashMap<String, String>,
    service_chain: Option<Arc<dyn ServiceChainer>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn with_service_chain(mut self, chainer: Arc<dyn ServiceChainer>) -> Self {
        self.service_chain = Some(chainer);
        self
    }

    pub fn with_chain_key(mut self, key: &str) -> Self {
        self.set(SERVICE_CHAIN_NAME, key);
        self
    }

    pub fn service_chain(&self) -> Option<&Arc<dyn ServiceChainer>> {
        self.service_chain.as_ref()
    }

    /// Chain key, if one was set and is non-empty.
    pub fn chain_key(&self) -> Option<&str> {
        self.get(SERVICE_CHAIN_NAME).filter(|key| !key.is_empty())
    }

    pub(crate) fn annotate(
        &mut self,
        app_name: &str,
        protocol: &str,
        domain: &str,
        service: &str,
        method: &str,
    ) {
        self.set(APP_NAME, app_name);
        self.set(PROTOCOL, protocol);
        self.set(DOMAIN, domain);
        self.set(SERVICE, service);
        self.set(METHOD, method);
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("values", &self.values)
            .field("service_chain", &self.service_chain.is_some())
            .finish()
    }
}
