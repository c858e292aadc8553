/// Selection pipeline tests
/// Runs lookups against live pools to check strategy, datacenter and service-chain narrowing
mod common;

use async_trait::async_trait;
use common::{eventually, manager_with, server, MockTransport, ORDERS};
use meshpool::balance::LoadBalancer;
use meshpool::chain::{EndpointMetadata, StaticServiceChain};
use meshpool::config::Config;
use meshpool::registry::ServerDescriptor;
use meshpool::{CallContext, Connection, ConnectionManager, PoolError};
use std::collections::HashMap;
use std::sync::Arc;

fn order_server(host: &str, idc: &str, weight: Option<u32>) -> ServerDescriptor {
    let mut descriptor = server(host, Some(idc), &[(ORDERS, &["get"])]);
    descriptor.weight = weight;
    descriptor
}

/// Manager with `servers` registered and all of them connected.
async fn connected(config: Config, servers: Vec<ServerDescriptor>) -> Arc<ConnectionManager> {
    let expected = servers.len();
    let manager = manager_with(config, MockTransport::new());
    let pool = manager.apply_full_set("orders", servers).await.unwrap();
    eventually(|| {
        let pool = pool.clone();
        async move { pool.active_connections().await.len() == expected }
    })
    .await;
    manager
}

fn two_datacenters() -> Vec<ServerDescriptor> {
    vec![
        order_server("10.0.0.1", "dc1", None),
        order_server("10.0.0.2", "dc2", None),
    ]
}

fn local(idc: &str) -> Config {
    let mut config = Config::default();
    config.pool.idc = Some(idc.to_string());
    config
}

async fn pick(manager: &ConnectionManager, ctx: &CallContext) -> meshpool::Result<String> {
    let mut ctx = ctx.clone();
    let connection = manager
        .lookup("nova", "com.example", ORDERS, "get", &mut ctx)
        .await?
        .expect("active connection");
    Ok(connection.endpoint().host.clone())
}

async fn tally(
    manager: &ConnectionManager,
    ctx: &CallContext,
    rounds: usize,
) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for _ in 0..rounds {
        *counts.entry(pick(manager, ctx).await.unwrap()).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn round_robin_alternates_between_equal_endpoints() {
    let manager = connected(Config::default(), two_datacenters()).await;
    let ctx = CallContext::new();

    let mut previous = pick(&manager, &ctx).await.unwrap();
    for _ in 0..9 {
        let next = pick(&manager, &ctx).await.unwrap();
        assert_ne!(next, previous);
        previous = next;
    }
}

#[tokio::test]
async fn round_robin_honours_weights() {
    let manager = connected(
        Config::default(),
        vec![
            order_server("10.0.0.1", "dc1", Some(200)),
            order_server("10.0.0.2", "dc1", Some(100)),
        ],
    )
    .await;

    let counts = tally(&manager, &CallContext::new(), 300).await;
    assert_eq!(counts["10.0.0.1"], 200);
    assert_eq!(counts["10.0.0.2"], 100);
}

#[tokio::test]
async fn random_strategy_reaches_every_endpoint() {
    let mut config = Config::default();
    config.connection.nova.load_balancing_strategy = "random".to_string();
    let manager = connected(config, two_datacenters()).await;

    let counts = tally(&manager, &CallContext::new(), 200).await;
    assert_eq!(counts.len(), 2);
    assert_eq!(counts.values().sum::<usize>(), 200);
}

#[tokio::test]
async fn local_datacenter_is_preferred() {
    let manager = connected(local("dc1"), two_datacenters()).await;

    let counts = tally(&manager, &CallContext::new(), 20).await;
    assert_eq!(counts.get("10.0.0.1"), Some(&20));
    assert!(!counts.contains_key("10.0.0.2"));
}

#[tokio::test]
async fn unknown_local_datacenter_falls_back_to_all() {
    let manager = connected(local("dc9"), two_datacenters()).await;

    let counts = tally(&manager, &CallContext::new(), 20).await;
    assert_eq!(counts.len(), 2);
}

#[tokio::test]
async fn chain_hit_pins_and_outranks_locality() {
    let manager = connected(local("dc1"), two_datacenters()).await;
    let chain = Arc::new(StaticServiceChain::new());
    chain.assign("orders", "canary", "10.0.0.2:8050", EndpointMetadata::new());

    let pinned = CallContext::new()
        .with_service_chain(chain.clone())
        .with_chain_key("canary");
    let counts = tally(&manager, &pinned, 10).await;
    assert_eq!(counts.get("10.0.0.2"), Some(&10));

    // Calls without the key keep away from the pinned endpoint.
    let unpinned = CallContext::new().with_service_chain(chain.clone());
    let counts = tally(&manager, &unpinned, 10).await;
    assert_eq!(counts.get("10.0.0.1"), Some(&10));

    // A key nobody registered behaves like no key.
    let stray = CallContext::new()
        .with_service_chain(chain)
        .with_chain_key("blue");
    let counts = tally(&manager, &stray, 10).await;
    assert_eq!(counts.get("10.0.0.1"), Some(&10));
}

#[tokio::test]
async fn unreachable_chain_target_fails_with_no_free_connection() {
    let manager = connected(Config::default(), two_datacenters()).await;
    let chain = Arc::new(StaticServiceChain::new());
    chain.assign("orders", "canary", "10.0.0.9:8050", EndpointMetadata::new());

    let ctx = CallContext::new()
        .with_service_chain(chain)
        .with_chain_key("canary");
    let result = pick(&manager, &ctx).await;
    assert!(matches!(result, Err(PoolError::NoFreeConnection(_))));
}

struct FirstCandidate;

#[async_trait]
impl LoadBalancer for FirstCandidate {
    async fn select(&self, candidates: &[Arc<Connection>]) -> meshpool::Result<Arc<Connection>> {
        candidates
            .first()
            .cloned()
            .ok_or_else(|| PoolError::NoFreeConnection("no candidates".to_string()))
    }

    fn name(&self) -> &'static str {
        "first"
    }
}

#[tokio::test]
async fn custom_strategy_can_be_registered() {
    let mut config = Config::default();
    config.connection.nova.load_balancing_strategy = "first".to_string();
    let manager = ConnectionManager::builder(config)
        .transport(MockTransport::new())
        .strategy("first", || Arc::new(FirstCandidate) as Arc<dyn LoadBalancer>)
        .build()
        .unwrap();

    let pool = manager
        .apply_full_set("orders", two_datacenters())
        .await
        .unwrap();
    assert_eq!(pool.strategy_name(), "first");
    eventually(|| {
        let pool = pool.clone();
        async move { pool.active_connections().await.len() == 2 }
    })
    .await;

    let counts = tally(&manager, &CallContext::new(), 5).await;
    assert_eq!(counts.get("10.0.0.1"), Some(&5));
}
