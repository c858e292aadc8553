use super::connection::{Connection, ConnectionId, ConnectionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Point-in-time view of one app pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub app_name: String,
    pub pool_id: Uuid,
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub endpoints: Vec<String>,
    pub active: usize,
    pub pending: usize,
    pub connections: Vec<ConnectionInfo>,
    /// Next reconnect delay per endpoint, when non-zero.
    pub backoff_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub endpoint: String,
    pub state: ConnectionState,
    pub weight: u32,
    pub idc: Option<String>,
    pub idle_ms: u64,
}

impl From<&Connection> for ConnectionInfo {
    fn from(connection: &Connection) -> Self {
        Self {
            id: connection.id(),
            endpoint: connection.endpoint().to_string(),
            state: connection.state(),
            weight: connection.weight(),
            idc: connection.idc().map(str::to_string),
            idle_ms: connection.idle_for().as_millis() as u64,
        }
    }
}
