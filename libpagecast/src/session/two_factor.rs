//! Out-of-band completion of two-factor challenges
//!
//! A session that hits a two-factor prompt registers a wait under its session
//! key and blocks (bounded) on the returned receiver. Whoever holds the
//! broker, such as an operator tool, resolves it with an approval or a code.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoFactorResolution {
    /// Approved on another device, nothing to type
    Approved,
    /// Code to enter into the prompt
    Code(String),
}

#[derive(Debug, Default)]
pub struct TwoFactorBroker {
    waiters: Mutex<HashMap<String, oneshot::Sender<TwoFactorResolution>>>,
}

impl TwoFactorBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<TwoFactorResolution>>> {
        // The map stays consistent even if a holder panicked
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending challenge. A second registration under the same
    /// key replaces the first, whose receiver then reports cancellation.
    pub fn register(&self, key: &str) -> oneshot::Receiver<TwoFactorResolution> {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(key.to_string(), tx);
        info!(session = key, "Two-factor challenge pending");
        rx
    }

    /// Complete a pending challenge. Returns false when nothing is waiting
    /// under `key` or the waiter already gave up.
    pub fn resolve(&self, key: &str, resolution: TwoFactorResolution) -> bool {
        match self.waiters().remove(key) {
            Some(tx) => {
                let delivered = tx.send(resolution).is_ok();
                debug!(session = key, delivered, "Two-factor challenge resolved");
                delivered
            }
            None => false,
        }
    }

    /// Drop a pending challenge without resolving it
    pub fn cancel(&self, key: &str) {
        self.waiters().remove(key);
    }

    /// Keys of challenges still waiting, sorted
    pub fn pending(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .waiters()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_code() {
        let broker = TwoFactorBroker::new();
        let rx = broker.register("page-a/1");

        assert_eq!(broker.pending(), vec!["page-a/1".to_string()]);
        assert!(broker.resolve("page-a/1", TwoFactorResolution::Code("123456".to_string())));

        assert_eq!(rx.await.unwrap(), TwoFactorResolution::Code("123456".to_string()));
        assert!(broker.pending().is_empty());
    }

    #[test]
    fn test_resolve_unknown_key() {
        let broker = TwoFactorBroker::new();
        assert!(!broker.resolve("missing", TwoFactorResolution::Approved));
    }

    #[test]
    fn test_dropped_receiver_is_not_pending() {
        let broker = TwoFactorBroker::new();
        let rx = broker.register("page-a/1");
        drop(rx);

        assert!(broker.pending().is_empty());
        assert!(!broker.resolve("page-a/1", TwoFactorResolution::Approved));
    }

    #[tokio::test]
    async fn test_cancel_closes_receiver() {
        let broker = TwoFactorBroker::new();
        let rx = broker.register("page-a/1");

        broker.cancel("page-a/1");
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_reregister_replaces_waiter() {
        let broker = TwoFactorBroker::new();
        let first = broker.register("k");
        let second = broker.register("k");

        assert!(first.await.is_err());
        assert!(broker.resolve("k", TwoFactorResolution::Approved));
        assert_eq!(second.await.unwrap(), TwoFactorResolution::Approved);
    }
}
