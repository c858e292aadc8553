use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};

/// Returned when a waiter's deadline passes before it is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition wait timed out")]
pub struct ConditionTimeout;

/// Keyed suspend/wake list.
///
/// A caller subscribes to a key *before* checking the state it waits for, then
/// suspends on the returned [`Waiter`]. Any `wake(key)` issued after the
/// subscription releases every waiter registered under that key, so a wake that
/// races with the check is never lost. Wakes carry no payload: callers must
/// re-check their condition after waking. A key's slot lives only as long as
/// somebody waits on it.
///
/// ```text
/// loop {
///     let mut waiter = condition.subscribe(&key);
///     if ready() { break; }
///     waiter.wait(deadline).await?;
/// }
/// ```
#[derive(Debug)]
pub struct Condition<K>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, watch::Sender<u64>>>,
}

impl<K> Condition<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Register interest in `key`.
    pub fn subscribe(&self, key: &K) -> Waiter<K> {
        let rx = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe();
        Waiter {
            rx: Some(rx),
            key: key.clone(),
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Release all waiters currently subscribed to `key`.
    ///
    /// Returns how many waiters were subscribed at the time of the wake.
    pub fn wake(&self, key: &K) -> usize {
        let woken = match self.slots.get(key) {
            Some(tx) => {
                let count = tx.receiver_count();
                tx.send_modify(|generation| *generation = generation.wrapping_add(1));
                count
            }
            None => return 0,
        };

        // Slots nobody listens on any more are dropped so the map only holds live keys.
        self.slots.remove_if(key, |_, tx| tx.receiver_count() == 0);
        woken
    }

    /// Number of waiters currently subscribed to `key`.
    pub fn waiting(&self, key: &K) -> usize {
        self.slots
            .get(key)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of keys somebody is currently waiting on.
    pub fn keys(&self) -> usize {
        self.slots.len()
    }
}

impl<K> Default for Condition<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// One registered waiter. Dropping it cancels the wait without affecting others;
/// the last waiter on a key takes the key's slot with it.
#[derive(Debug)]
pub struct Waiter<K>
where
    K: Eq + Hash,
{
    rx: Option<watch::Receiver<u64>>,
    key: K,
    slots: Weak<DashMap<K, watch::Sender<u64>>>,
}

impl<K> Waiter<K>
where
    K: Eq + Hash,
{
    /// Suspend until woken or until `deadline`.
    pub async fn wait(&mut self, deadline: Instant) -> Result<(), ConditionTimeout> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(ConditionTimeout);
        };
        match timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // The condition itself went away; nothing can wake us any more.
                sleep_until(deadline).await;
                Err(ConditionTimeout)
            }
            Err(_) => Err(ConditionTimeout),
        }
    }
}

impl<K> Drop for Waiter<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // Release our receiver first so the count below no longer includes it.
        drop(self.rx.take());
        if let Some(slots) = self.slots.upgrade() {
            slots.remove_if(&self.key, |_, tx| tx.receiver_count() == 0);
        }
    }
}
