//! Shared fixtures for integration tests: an in-memory transport and registry builders.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashSet;
use meshpool::config::Config;
use meshpool::pool::EndpointConfig;
use meshpool::registry::{Endpoint, ServerDescriptor, ServiceEntry};
use meshpool::transport::{BoxedStream, Transport};
use meshpool::ConnectionManager;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::time::Instant;

/// Transport backed by `tokio::io::duplex` pipes.
///
/// The server half of every accepted dial is kept here so tests can talk to
/// it or drop it to simulate the peer going away.
pub struct MockTransport {
    peers: Mutex<Vec<(Endpoint, DuplexStream)>>,
    refused: DashSet<Endpoint>,
    dials: Mutex<Vec<(Endpoint, Instant)>>,
    gate: watch::Sender<bool>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            refused: DashSet::new(),
            dials: Mutex::new(Vec::new()),
            gate,
        })
    }

    /// Make dials to `endpoint` fail with connection refused.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.refused.insert(endpoint.clone());
    }

    pub fn accept(&self, endpoint: &Endpoint) {
        self.refused.remove(endpoint);
    }

    /// Park every dial until `release`.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Drop the server side of every pipe to `endpoint`.
    pub fn hang_up(&self, endpoint: &Endpoint) -> usize {
        let mut peers = self.peers.lock().unwrap();
        let before = peers.len();
        peers.retain(|(peer, _)| peer != endpoint);
        before - peers.len()
    }

    pub fn take_peer(&self, endpoint: &Endpoint) -> Option<DuplexStream> {
        let mut peers = self.peers.lock().unwrap();
        let index = peers.iter().position(|(peer, _)| peer == endpoint)?;
        Some(peers.remove(index).1)
    }

    pub fn dials(&self) -> Vec<(Endpoint, Instant)> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self, endpoint: &Endpoint) -> usize {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|(peer, _)| peer == endpoint)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, config: &EndpointConfig) -> std::io::Result<BoxedStream> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.dials
            .lock()
            .unwrap()
            .push((config.endpoint.clone(), Instant::now()));

        if self.refused.contains(&config.endpoint) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused", config.endpoint),
            ));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        self.peers
            .lock()
            .unwrap()
            .push((config.endpoint.clone(), server));
        Ok(Box::new(client))
    }
}

pub fn server(host: &str, idc: Option<&str>, services: &[(&str, &[&str])]) -> ServerDescriptor {
    ServerDescriptor {
        protocol: "nova".to_string(),
        namespace: "com.example".to_string(),
        host: host.to_string(),
        port: 8050,
        weight: None,
        idc: idc.map(str::to_string),
        services: services
            .iter()
            .map(|(service, methods)| ServiceEntry {
                service: service.to_string(),
                methods: methods.iter().map(|m| m.to_string()).collect(),
            })
            .collect(),
    }
}

pub const ORDERS: &str = "com.example.OrderService";

pub fn order_server(host: &str) -> ServerDescriptor {
    server(host, None, &[(ORDERS, &["create", "get"])])
}

pub fn manager_with(config: Config, transport: Arc<MockTransport>) -> Arc<ConnectionManager> {
    ConnectionManager::builder(config)
        .transport(transport)
        .build()
        .unwrap()
}

pub fn manager(transport: Arc<MockTransport>) -> Arc<ConnectionManager> {
    manager_with(Config::default(), transport)
}

/// Poll `check` until it holds, letting other tasks run in between.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
