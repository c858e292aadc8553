use crate::registry::Endpoint;
use std::collections::HashMap;
use std::time::Duration;

/// Per-endpoint reconnect delays.
///
/// Each failed attempt adds one step, up to the cap. A successful connect
/// resets the endpoint to zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max: Duration,
    delays: HashMap<Endpoint, Duration>,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            delays: HashMap::new(),
        }
    }

    /// Delay to apply to the next reconnect of `endpoint`.
    pub fn current(&self, endpoint: &Endpoint) -> Duration {
        self.delays.get(endpoint).copied().unwrap_or(Duration::ZERO)
    }

    /// Return the current delay and grow it for the attempt after.
    pub fn next_delay(&mut self, endpoint: &Endpoint) -> Duration {
        let current = self.current(endpoint);
        let grown = (current + self.step).min(self.max);
        self.delays.insert(endpoint.clone(), grown);
        current
    }

    pub fn reset(&mut self, endpoint: &Endpoint) {
        self.delays.insert(endpoint.clone(), Duration::ZERO);
    }

    pub fn forget(&mut self, endpoint: &Endpoint) {
        self.delays.remove(endpoint);
    }

    pub fn snapshot(&self) -> Vec<(Endpoint, Duration)> {
        let mut entries: Vec<(Endpoint, Duration)> = self
            .delays
            .iter()
            .map(|(endpoint, delay)| (endpoint.clone(), *delay))
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(5000), Duration::from_millis(30000))
    }

    #[test]
    fn first_reconnect_is_immediate_then_grows_to_cap() {
        let mut backoff = backoff();
        let endpoint = Endpoint::new("10.0.0.1", 8050);

        let delays: Vec<u128> = (0..9)
            .map(|_| backoff.next_delay(&endpoint).as_millis())
            .collect();
        assert_eq!(
            delays,
            vec![0, 5000, 10000, 15000, 20000, 25000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn reset_restarts_from_zero() {
        let mut backoff = backoff();
        let endpoint = Endpoint::new("10.0.0.1", 8050);
        backoff.next_delay(&endpoint);
        backoff.next_delay(&endpoint);
        assert_eq!(backoff.current(&endpoint), Duration::from_millis(10000));

        backoff.reset(&endpoint);
        assert_eq!(backoff.next_delay(&endpoint), Duration::ZERO);
    }

    #[test]
    fn endpoints_back_off_independently() {
        let mut backoff = backoff();
        let a = Endpoint::new("10.0.0.1", 8050);
        let b = Endpoint::new("10.0.0.2", 8050);
        backoff.next_delay(&a);
        backoff.next_delay(&a);

        assert_eq!(backoff.current(&b), Duration::ZERO);
        assert_eq!(backoff.snapshot()[0], (a, Duration::from_millis(10000)));
    }
}
