use super::{no_free_connection, LoadBalancer};
use crate::pool::Connection;
use crate::utils::error::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

/// Random pick, proportional to connection weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

/// Map a roll in `0..sum(weights)` onto an index.
fn pick_index(weights: &[u32], roll: u64) -> usize {
    let mut remaining = roll;
    for (index, weight) in weights.iter().enumerate() {
        let weight = *weight as u64;
        if remaining < weight {
            return index;
        }
        remaining -= weight;
    }
    weights.len() - 1
}

fn choose(weights: &[u32]) -> usize {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    let mut rng = rand::thread_rng();
    if total == 0 {
        rng.gen_range(0..weights.len())
    } else {
        pick_index(weights, rng.gen_range(0..total))
    }
}

#[async_trait]
impl LoadBalancer for WeightedRandom {
    async fn select(&self, candidates: &[Arc<Connection>]) -> Result<Arc<Connection>> {
        if candidates.is_empty() {
            return Err(no_free_connection());
        }

        let weights: Vec<u32> = candidates.iter().map(|c| c.weight()).collect();
        Ok(candidates[choose(&weights)].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
