use super::app_pool::AppPool;
use super::endpoint::EndpointConfig;
use super::metrics::PoolMetrics;
use crate::registry::Endpoint;
use crate::transport::{BoxedStream, HeartbeatRegistry, Transport};
use crate::utils::error::{PoolError, Result};
use crate::utils::run_guarded;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

pub type ReceiveCallback = Box<dyn FnMut(Bytes) -> anyhow::Result<()> + Send>;
pub type CloseCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// One long-lived connection to one endpoint.
///
/// Lifecycle: `Connecting -> Active -> Closed`, or `Connecting -> Closed` when
/// the dial fails or times out. Closed is terminal; reconnecting always makes a
/// new `Connection`. A connection keeps only a weak handle to its pool.
pub struct Connection {
    id: ConnectionId,
    config: Arc<EndpointConfig>,
    state: AtomicU8,
    closed: AtomicBool,
    opened_at: Instant,
    /// Milliseconds after `opened_at` of the last real traffic.
    last_used_ms: AtomicU64,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    on_receive: Mutex<Option<ReceiveCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    cancel: CancellationToken,
    pool: Weak<AppPool>,
    heartbeats: Arc<HeartbeatRegistry>,
}

impl Connection {
    pub(crate) fn new(
        config: Arc<EndpointConfig>,
        pool: Weak<AppPool>,
        heartbeats: Arc<HeartbeatRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            config,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            writer: Mutex::new(None),
            on_receive: Mutex::new(None),
            on_close: Mutex::new(None),
            cancel,
            pool,
            heartbeats,
        })
    }

    /// A connection that belongs to no pool. It is never reconnected.
    pub fn detached(config: EndpointConfig, heartbeats: Arc<HeartbeatRegistry>) -> Arc<Self> {
        Self::new(
            Arc::new(config),
            Weak::new(),
            heartbeats,
            CancellationToken::new(),
        )
    }

    /// Start dialling on a background task.
    pub fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move { connection.run(transport).await })
    }

    async fn run(self: Arc<Self>, transport: Arc<dyn Transport>) {
        debug!(
            conn_id = %self.id,
            endpoint = %self.config.endpoint,
            "Connecting"
        );

        let dial = timeout(self.config.connect_timeout, transport.connect(&self.config));
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.shutdown(false).await;
                return;
            }
            result = dial => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(
                        conn_id = %self.id,
                        endpoint = %self.config.endpoint,
                        error = %e,
                        "Connection error"
                    );
                    self.close().await;
                    return;
                }
                Err(_) => {
                    warn!(
                        conn_id = %self.id,
                        endpoint = %self.config.endpoint,
                        timeout_ms = self.config.connect_timeout.as_millis() as u64,
                        "Connect timed out"
                    );
                    self.close().await;
                    return;
                }
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        if !self.on_connect(writer).await {
            return;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.shutdown(false).await;
            }
            outcome = self.read_loop(reader) => {
                match outcome {
                    Ok(()) => info!(
                        conn_id = %self.id,
                        endpoint = %self.config.endpoint,
                        "Connection closed by peer"
                    ),
                    Err(e) => warn!(
                        conn_id = %self.id,
                        endpoint = %self.config.endpoint,
                        error = %e,
                        "Connection error"
                    ),
                }
                self.close().await;
            }
            _ = self.heartbeat_loop() => {}
        }
    }

    async fn on_connect(self: &Arc<Self>, writer: WriteHalf<BoxedStream>) -> bool {
        if self.is_closed() {
            return false;
        }

        *self.writer.lock().await = Some(writer);
        // close() may have run while the writer was being installed.
        if self.is_closed() {
            self.release_socket().await;
            return false;
        }

        if self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        info!(
            conn_id = %self.id,
            endpoint = %self.config.endpoint,
            protocol = %self.config.protocol,
            "Connection established"
        );

        if let Some(pool) = self.pool.upgrade() {
            pool.connected(self).await;
        }
        true
    }

    async fn read_loop(&self, mut reader: ReadHalf<BoxedStream>) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            buf.reserve(READ_BUFFER_SIZE);
            if reader.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
            let data = buf.split().freeze();
            self.dispatch(data).await;
        }
    }

    async fn dispatch(&self, data: Bytes) {
        let mut callback = self.on_receive.lock().await;
        match callback.as_mut() {
            Some(callback) => {
                run_guarded("on_receive", || callback(data));
            }
            None => trace!(
                conn_id = %self.id,
                bytes = data.len(),
                "Dropping inbound bytes, no receiver installed"
            ),
        }
    }

    /// Ping the peer whenever a full heartbeat interval passes without traffic.
    async fn heartbeat_loop(&self) {
        let interval = self.config.heartbeat_interval;
        if interval.is_zero() {
            return std::future::pending().await;
        }

        let mut wait = interval;
        loop {
            sleep(wait).await;
            let idle = self.idle_for();
            if idle >= interval {
                self.ping().await;
                wait = interval;
            } else {
                wait = interval - idle;
            }
        }
    }

    async fn ping(&self) {
        let protocol = self.config.protocol.as_str();
        let Some(heartbeat) = self.heartbeats.get(protocol) else {
            trace!(conn_id = %self.id, protocol, "No heartbeat registered");
            return;
        };

        match heartbeat.ping(self).await {
            Ok(()) => {
                debug!(conn_id = %self.id, endpoint = %self.config.endpoint, "Heartbeat sent");
                PoolMetrics::heartbeat(protocol, true);
            }
            Err(e) => {
                warn!(
                    conn_id = %self.id,
                    endpoint = %self.config.endpoint,
                    error = %e,
                    "Heartbeat failed"
                );
                PoolMetrics::heartbeat(protocol, false);
            }
        }
    }

    /// Write bytes to the peer and mark the connection as used.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            if self.is_closed() {
                return Err(PoolError::ConnectionClosed);
            }
            return Err(PoolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection not established yet",
            )));
        };
        stream.write_all(&data).await?;
        stream.flush().await?;
        drop(writer);

        self.touch();
        Ok(())
    }

    /// Close the connection and let its pool schedule a reconnect.
    pub async fn close(&self) {
        self.shutdown(true).await;
    }

    /// Close the connection without reconnecting, used when its endpoint left the pool.
    pub async fn retire(&self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&self, reconnect: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous =
            ConnectionState::from_u8(self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel));
        self.cancel.cancel();

        if let Some(callback) = self.on_close.lock().await.take() {
            run_guarded("on_close", callback);
        }
        self.release_socket().await;

        info!(
            conn_id = %self.id,
            endpoint = %self.config.endpoint,
            previous = ?previous,
            reconnect,
            "Connection closed"
        );

        if let Some(pool) = self.pool.upgrade() {
            pool.remove(self).await;
            if reconnect {
                pool.reload(self.config.clone()).await;
            }
        }
    }

    async fn release_socket(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(conn_id = %self.id, error = %e, "Socket shutdown failed");
            }
        }
    }

    /// Install the handler for inbound bytes. Errors and panics in it are logged and swallowed.
    pub async fn on_receive<F>(&self, callback: F)
    where
        F: FnMut(Bytes) -> anyhow::Result<()> + Send + 'static,
    {
        *self.on_receive.lock().await = Some(Box::new(callback));
    }

    /// Install the handler run once when the connection closes.
    pub async fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        *self.on_close.lock().await = Some(Box::new(callback));
    }

    /// Record real traffic; postpones the next heartbeat.
    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_used_ms.store(elapsed, Ordering::Release);
    }

    /// Time since the connection was last used (or opened).
    pub fn idle_for(&self) -> Duration {
        let last_used = self.opened_at
            + Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        Instant::now().saturating_duration_since(last_used)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    pub fn protocol(&self) -> &str {
        &self.config.protocol
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn idc(&self) -> Option<&str> {
        self.config.idc.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.config.endpoint)
            .field("protocol", &self.config.protocol)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::registry::ServerDescriptor;
    use crate::transport::{FrameHeartbeat, Heartbeat};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    struct DuplexTransport {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Transport for DuplexTransport {
        async fn connect(&self, _config: &EndpointConfig) -> std::io::Result<BoxedStream> {
            let (client, server) = tokio::io::duplex(4096);
            let _ = self.peers.send(server);
            Ok(Box::new(client))
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn connect(&self, _config: &EndpointConfig) -> std::io::Result<BoxedStream> {
            std::future::pending().await
        }
    }

    fn config(heartbeat_ms: u64) -> EndpointConfig {
        let server = ServerDescriptor {
            protocol: "nova".to_string(),
            namespace: "test".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8050,
            weight: Some(42),
            idc: Some("dc1".to_string()),
            services: Vec::new(),
        };
        let mut config = EndpointConfig::from_server(&server, &ConnectionSettings::default());
        config.heartbeat_interval = Duration::from_millis(heartbeat_ms);
        config
    }

    fn duplex() -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(DuplexTransport { peers: tx }), rx)
    }

    async fn wait_active(connection: &Connection) {
        for _ in 0..100 {
            if connection.is_active() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connection never became active");
    }

    #[tokio::test]
    async fn send_reaches_peer_and_receive_reaches_callback() {
        let (transport, mut peers) = duplex();
        let connection = Connection::detached(config(60_000), Arc::new(HeartbeatRegistry::new()));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        connection
            .on_receive(move |data| {
                seen_tx.send(data)?;
                Ok(())
            })
            .await;

        connection.connect(transport);
        let mut peer = peers.recv().await.unwrap();
        wait_active(&connection).await;

        connection.send(Bytes::from_static(b"hello")).await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").await.unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), Bytes::from_static(b"world"));
        assert_eq!(connection.weight(), 42);
        assert_eq!(connection.idc(), Some("dc1"));
    }

    #[tokio::test]
    async fn peer_close_runs_close_callback_once() {
        let (transport, mut peers) = duplex();
        let connection = Connection::detached(config(60_000), Arc::new(HeartbeatRegistry::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        connection
            .on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let driver = connection.connect(transport);
        let peer = peers.recv().await.unwrap();
        wait_active(&connection).await;

        drop(peer);
        driver.await.unwrap();
        connection.close().await;

        assert!(connection.is_closed());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            connection.send(Bytes::from_static(b"late")).await,
            Err(PoolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn panicking_receive_callback_does_not_kill_connection() {
        let (transport, mut peers) = duplex();
        let connection = Connection::detached(config(60_000), Arc::new(HeartbeatRegistry::new()));
        connection.on_receive(|_| panic!("bad handler")).await;

        connection.connect(transport);
        let mut peer = peers.recv().await.unwrap();
        wait_active(&connection).await;

        peer.write_all(b"boom").await.unwrap();
        tokio::task::yield_now().await;

        assert!(connection.is_active());
        connection.send(Bytes::from_static(b"still-up")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_closes_connection() {
        let connection = Connection::detached(config(60_000), Arc::new(HeartbeatRegistry::new()));
        let driver = connection.connect(Arc::new(StalledTransport));

        driver.await.unwrap();
        assert!(connection.is_closed());
    }

    struct FailingHeartbeat {
        calls: std::sync::Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Heartbeat for FailingHeartbeat {
        async fn ping(&self, _connection: &Connection) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Instant::now());
            anyhow::bail!("peer did not answer")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_keeps_connection_and_schedule() {
        let failing = Arc::new(FailingHeartbeat {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let mut heartbeats = HeartbeatRegistry::new();
        heartbeats.register("nova", failing.clone());
        let (transport, mut peers) = duplex();
        let connection = Connection::detached(config(1_000), Arc::new(heartbeats));

        connection.connect(transport);
        let mut peer = peers.recv().await.unwrap();
        wait_active(&connection).await;

        sleep(Duration::from_millis(3_500)).await;

        let calls = failing.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(1_000));
        }
        assert!(connection.is_active());
        assert_eq!(connection.state(), ConnectionState::Active);

        connection.send(Bytes::from_static(b"live")).await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"live");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_pinged_busy_connection_is_not() {
        let mut heartbeats = HeartbeatRegistry::new();
        heartbeats.register("nova", Arc::new(FrameHeartbeat::new(&b"PING"[..])));
        let (transport, mut peers) = duplex();
        let connection = Connection::detached(config(1_000), Arc::new(heartbeats));

        connection.connect(transport);
        let mut peer = peers.recv().await.unwrap();
        wait_active(&connection).await;

        // Traffic at 600ms pushes the first ping to 1600ms.
        sleep(Duration::from_millis(600)).await;
        connection.send(Bytes::from_static(b"data")).await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");

        sleep(Duration::from_millis(500)).await;
        let early = tokio::time::timeout(Duration::from_millis(1), peer.read_exact(&mut buf)).await;
        assert!(early.is_err(), "ping sent while connection was busy");

        sleep(Duration::from_millis(600)).await;
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
    }
}
