use crate::pool::Connection;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Protocol-specific keepalive probe.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn ping(&self, connection: &Connection) -> anyhow::Result<()>;
}

/// Heartbeat that writes one fixed frame, for protocols whose ping never changes.
#[derive(Debug, Clone)]
pub struct FrameHeartbeat {
    frame: Bytes,
}

impl FrameHeartbeat {
    pub fn new(frame: impl Into<Bytes>) -> Self {
        Self {
            frame: frame.into(),
        }
    }
}

#[async_trait]
impl Heartbeat for FrameHeartbeat {
    async fn ping(&self, connection: &Connection) -> anyhow::Result<()> {
        connection.send(self.frame.clone()).await?;
        Ok(())
    }
}

/// Heartbeat implementations keyed by protocol name.
#[derive(Clone, Default)]
pub struct HeartbeatRegistry {
    by_protocol: HashMap<String, Arc<dyn Heartbeat>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: &str, heartbeat: Arc<dyn Heartbeat>) {
        self.by_protocol.insert(protocol.to_string(), heartbeat);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Heartbeat>> {
        self.by_protocol.get(protocol).cloned()
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut protocols: Vec<&str> = self.by_protocol.keys().map(String::as_str).collect();
        protocols.sort_unstable();
        protocols
    }
}

impl std::fmt::Debug for HeartbeatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}
