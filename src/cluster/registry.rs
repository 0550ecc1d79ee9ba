//! Correlation registry: pending requests keyed by correlation id.
//!
//! Each entry pairs a key with a one-shot completion and a deadline. The
//! first of `resolve`, `reject` or the deadline settles the entry; anything
//! arriving afterwards for the same key is discarded.

use crate::error::{ClusterError, Result};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Budget for primary-side relays to a sibling.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for worker-issued requests. Longer than [`RELAY_TIMEOUT`] so the
/// relay reports its own timeout before the caller gives up.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(65);

type Completion<T> = oneshot::Sender<Result<T>>;

/// Table of pending requests owned by one process.
pub struct CorrelationRegistry<K, T> {
    pending: Arc<Mutex<HashMap<K, Completion<T>>>>,
}

impl<K, T> Clone for CorrelationRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

impl<K, T> Default for CorrelationRegistry<K, T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> CorrelationRegistry<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Completion<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` with a deadline `timeout` from now.
    ///
    /// Fails if `key` is already pending.
    pub fn register(&self, key: K, timeout: Duration) -> Result<PendingResponse<K, T>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.contains_key(&key) {
                return Err(ClusterError::DuplicateCorrelation(format!("{:?}", key)));
            }
            pending.insert(key.clone(), tx);
        }
        Ok(PendingResponse {
            key,
            deadline: Instant::now() + timeout,
            rx,
            registry: self.clone(),
        })
    }

    /// Settle `key` successfully. Returns `false` if it was not pending.
    pub fn resolve(&self, key: &K, value: T) -> bool {
        self.settle(key, Ok(value))
    }

    /// Settle `key` with an error. Returns `false` if it was not pending.
    pub fn reject(&self, key: &K, reason: ClusterError) -> bool {
        self.settle(key, Err(reason))
    }

    fn settle(&self, key: &K, outcome: Result<T>) -> bool {
        let Some(tx) = self.lock().remove(key) else {
            tracing::trace!(key = ?key, "Discarding settlement for unknown correlation id");
            return false;
        };
        // The waiter may have been dropped; the entry is settled either way.
        let _ = tx.send(outcome);
        true
    }

    fn remove(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Completion handle returned by [`CorrelationRegistry::register`].
///
/// Dropping it without waiting unregisters the key.
pub struct PendingResponse<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    key: K,
    deadline: Instant,
    rx: oneshot::Receiver<Result<T>>,
    registry: CorrelationRegistry<K, T>,
}

impl<K, T> PendingResponse<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait for the entry to settle.
    ///
    /// Yields [`ClusterError::NoResponse`] if the deadline passes first.
    pub async fn wait(mut self) -> Result<T> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClusterError::ChannelClosed("correlation registry".into())),
            Err(_) => {
                if self.registry.remove(&self.key) {
                    Err(ClusterError::NoResponse)
                } else {
                    // Settled between the timer firing and the removal.
                    self.rx.try_recv().unwrap_or(Err(ClusterError::NoResponse))
                }
            }
        }
    }
}

impl<K, T> Drop for PendingResponse<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_completes_waiter() {
        let registry: CorrelationRegistry<String, u32> = CorrelationRegistry::new();
        let pending = registry.register("a".into(), Duration::from_secs(5)).unwrap();
        assert!(registry.contains(&"a".to_string()));

        assert!(registry.resolve(&"a".into(), 7));
        assert_eq!(pending.wait().await.unwrap(), 7);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let registry: CorrelationRegistry<String, u32> = CorrelationRegistry::new();
        let pending = registry.register("a".into(), Duration::from_secs(5)).unwrap();

        assert!(registry.resolve(&"a".into(), 1));
        assert!(!registry.resolve(&"a".into(), 2));
        assert!(!registry.reject(&"a".into(), ClusterError::Unavailable));

        assert_eq!(pending.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reject_completes_with_error() {
        let registry: CorrelationRegistry<String, u32> = CorrelationRegistry::new();
        let pending = registry.register("a".into(), Duration::from_secs(5)).unwrap();

        assert!(registry.reject(&"a".into(), ClusterError::Unavailable));
        assert!(!registry.resolve(&"a".into(), 3));

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_produces_no_response() {
        let registry: CorrelationRegistry<String, u32> = CorrelationRegistry::new();
        let start = Instant::now();
        let pending = registry.register("a".into(), RELAY_TIMEOUT).unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "No response was received!");
        assert!(start.elapsed() >= RELAY_TIMEOUT);
        assert!(registry.is_empty());

        // A late answer is discarded.
        assert!(!registry.resolve(&"a".into(), 9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_measured_from_registration() {
        let registry: CorrelationRegistry<String, u32> = CorrelationRegistry::new();
        let start = Instant::now();
        let pending = registry.register("a".into(), Duration::from_secs(10)).unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(pending.wait().await.is_err());
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let registry: CorrelationRegistry<String, u32> = CorrelationRegistry::new();
        let _pending = registry.register("a".into(), Duration::from_secs(5)).unwrap();
        let err = registry.register("a".into(), Duration::from_secs(5)).err();
        assert!(matches!(err, Some(ClusterError::DuplicateCorrelation(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dropping_handle_unregisters() {
        let registry: CorrelationRegistry<(String, u32), u32> = CorrelationRegistry::new();
        let pending = registry
            .register(("a".into(), 1), Duration::from_secs(5))
            .unwrap();
        assert_eq!(registry.len(), 1);
        drop(pending);
        assert!(registry.is_empty());
        assert!(!registry.resolve(&("a".into(), 1), 0));
    }

    #[test]
    fn test_budget_ordering() {
        assert!(REQUEST_TIMEOUT > RELAY_TIMEOUT);
    }
}
