//! Long-poll listener registry.
//!
//! A retrieve that finds no messages and carries the long-poll header
//! registers a listener for its pubkey and parks on a oneshot receiver.
//! Message ingest notifies every listener registered at insert time.
//! Connections hold only a [`ListenerGuard`]; dropping it (response sent,
//! timeout, or connection torn down) deregisters, so the registry never
//! holds dangling entries and no back-references to connections exist.

use common::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<HashMap<String, Vec<(u64, oneshot::Sender<Message>)>>>,
    next_id: AtomicU64,
}

/// Deregisters its listener on drop.
pub struct ListenerGuard {
    registry: Arc<ListenerRegistry>,
    pubkey: String,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.pubkey, self.id);
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `pubkey`. The receiver resolves when a
    /// matching message arrives; the guard must outlive the wait.
    pub fn register(
        self: &Arc<Self>,
        pubkey: &str,
    ) -> (ListenerGuard, oneshot::Receiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .entry(pubkey.to_string())
            .or_default()
            .push((id, tx));
        trace!(pubkey = %pubkey, id, "Registered long-poll listener");
        let guard = ListenerGuard {
            registry: Arc::clone(self),
            pubkey: pubkey.to_string(),
            id,
        };
        (guard, rx)
    }

    fn remove(&self, pubkey: &str, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(listeners) = inner.get_mut(pubkey) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                inner.remove(pubkey);
            }
        }
    }

    /// Wake every listener registered for the message's recipient.
    /// Returns the number of listeners notified.
    pub fn notify(&self, message: &Message) -> usize {
        let listeners = self.inner.lock().remove(&message.pubkey);
        let Some(listeners) = listeners else {
            return 0;
        };
        let count = listeners.len();
        for (_, tx) in listeners {
            // a receiver dropped mid-notify is fine, its guard already ran
            let _ = tx.send(message.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_for(pubkey: &str) -> Message {
        Message {
            pubkey: pubkey.to_string(),
            data: "notify".into(),
            hash: "h".into(),
            ttl_ms: 1000,
            timestamp_ms: 0,
            nonce: String::new(),
        }
    }

    #[tokio::test]
    async fn test_notify_wakes_registered_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let (_guard, rx) = registry.register("pk1");
        assert_eq!(registry.notify(&message_for("pk1")), 1);
        assert_eq!(rx.await.unwrap().data, "notify");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_notify_only_matching_pubkey() {
        let registry = Arc::new(ListenerRegistry::new());
        let (_g1, _rx1) = registry.register("pk1");
        assert_eq!(registry.notify(&message_for("pk2")), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_guard_drop_deregisters() {
        let registry = Arc::new(ListenerRegistry::new());
        {
            let (_guard, _rx) = registry.register("pk1");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
        assert_eq!(registry.notify(&message_for("pk1")), 0);
    }

    #[tokio::test]
    async fn test_multiple_listeners_same_pubkey() {
        let registry = Arc::new(ListenerRegistry::new());
        let (_g1, rx1) = registry.register("pk1");
        let (_g2, rx2) = registry.register("pk1");
        assert_eq!(registry.notify(&message_for("pk1")), 2);
        assert!(rx1.await.is_ok());
        assert!(rx2.await.is_ok());
    }
}
