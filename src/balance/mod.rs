//! Load balancing strategies used by an app pool to pick one live connection.

mod random;
mod round_robin;

pub use random::WeightedRandom;
pub use round_robin::WeightedRoundRobin;

use crate::pool::Connection;
use crate::utils::error::{PoolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Strategy selecting one connection out of a candidate set.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select the next connection.
    ///
    /// Fails with [`PoolError::NoFreeConnection`] when `candidates` is empty.
    async fn select(&self, candidates: &[Arc<Connection>]) -> Result<Arc<Connection>>;

    /// Notify the strategy that the pool membership changed.
    async fn refresh(&self, _connections: &[Arc<Connection>]) {
        // Default implementation - stateless strategies ignore membership
    }

    fn name(&self) -> &'static str;
}

pub type StrategyFactory = Arc<dyn Fn() -> Arc<dyn LoadBalancer> + Send + Sync>;

/// Named strategy constructors. Each pool gets its own strategy instance.
#[derive(Clone)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in strategies.
    ///
    /// `polling` and `roundRobin` are the same weighted round-robin.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("polling", || {
            Arc::new(WeightedRoundRobin::new()) as Arc<dyn LoadBalancer>
        });
        registry.register("roundRobin", || {
            Arc::new(WeightedRoundRobin::new()) as Arc<dyn LoadBalancer>
        });
        registry.register("random", || {
            Arc::new(WeightedRandom::new()) as Arc<dyn LoadBalancer>
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn LoadBalancer> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn LoadBalancer>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PoolError::StrategyNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

pub(crate) fn no_free_connection() -> PoolError {
    PoolError::NoFreeConnection("no candidate connection to select from".to_string())
}
