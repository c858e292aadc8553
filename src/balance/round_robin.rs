use super::{no_free_connection, LoadBalancer};
use crate::pool::Connection;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Interleaved weighted round-robin (the LVS scheduler).
///
/// Over a full cycle each connection is picked in proportion to its weight,
/// and picks of heavy connections are spread out instead of bunched together.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cursor: Mutex<Cursor>,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Index picked last; `None` before the first pick.
    index: Option<usize>,
    /// Current weight threshold.
    current: i64,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl Cursor {
    fn next(&mut self, weights: &[u32]) -> usize {
        let n = weights.len();
        let max = weights.iter().copied().max().unwrap_or(0) as i64;
        let step = weights.iter().copied().fold(0, gcd) as i64;

        let advance = |index: Option<usize>| index.map_or(0, |i| (i + 1) % n);

        if max == 0 {
            let picked = advance(self.index);
            self.index = Some(picked);
            return picked;
        }

        // The candidate set may have shrunk since the last pick.
        if self.current > max {
            self.current = max;
        }

        loop {
            let picked = advance(self.index);
            self.index = Some(picked);
            if picked == 0 {
                self.current -= step;
                if self.current <= 0 {
                    self.current = max;
                }
            }
            if weights[picked] as i64 >= self.current {
                return picked;
            }
        }
    }
}

#[async_trait]
impl LoadBalancer for WeightedRoundRobin {
    async fn select(&self, candidates: &[Arc<Connection>]) -> Result<Arc<Connection>> {
        if candidates.is_empty() {
            return Err(no_free_connection());
        }

        let weights: Vec<u32> = candidates.iter().map(|c| c.weight()).collect();
        let picked = self.cursor.lock().await.next(&weights);
        Ok(candidates[picked].clone())
    }

    async fn refresh(&self, _connections: &[Arc<Connection>]) {
        *self.cursor.lock().await = Cursor::default();
    }

    fn name(&self) -> &'static str {
        "roundRobin"
    }
}
