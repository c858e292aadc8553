mod app_pool;
mod backoff;
mod connection;
pub mod context;
mod endpoint;
mod manager;
pub mod metrics;
pub mod selection;
mod stats;

pub use app_pool::AppPool;
pub use backoff::Backoff;
pub use connection::{CloseCallback, Connection, ConnectionId, ConnectionState, ReceiveCallback};
pub use context::CallContext;
pub use endpoint::{EndpointConfig, DEFAULT_WEIGHT};
pub use manager::{ConnectionManager, ConnectionManagerBuilder};
pub use metrics::PoolMetrics;
pub use stats::{ConnectionInfo, PoolStats};

use crate::config::PoolSettings;
use crate::registry::{ServiceKey, ServiceStore};
use crate::transport::{HeartbeatRegistry, Transport};
use crate::utils::Condition;
use std::sync::Arc;
use uuid::Uuid;

/// What a suspended caller is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum WaitKey {
    /// A catalog entry for this service to appear.
    Service(ServiceKey),
    /// The pool with this id to gain an active connection.
    Pool(Uuid),
}

/// Collaborators shared by the manager and every pool it owns.
pub(crate) struct PoolRuntime {
    pub settings: PoolSettings,
    pub transport: Arc<dyn Transport>,
    pub heartbeats: Arc<HeartbeatRegistry>,
    pub service_store: Arc<dyn ServiceStore>,
    pub conditions: Arc<Condition<WaitKey>>,
}
