pub mod heartbeat;

pub use heartbeat::{FrameHeartbeat, Heartbeat, HeartbeatRegistry};

use crate::pool::EndpointConfig;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

/// Byte stream a connection runs on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the byte stream for one endpoint.
///
/// The connection applies its own connect timeout around `connect`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &EndpointConfig) -> std::io::Result<BoxedStream>;
}

/// Plain TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    keepalive: Option<Duration>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { keepalive: None }
    }

    /// Enable kernel TCP keepalive probes after `idle` of silence.
    pub fn with_keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = Some(idle);
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, config: &EndpointConfig) -> std::io::Result<BoxedStream> {
        let endpoint = &config.endpoint;
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;

        if let Some(idle) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }

        trace!(endpoint = %endpoint, "TCP stream established");
        Ok(Box::new(stream))
    }
}
