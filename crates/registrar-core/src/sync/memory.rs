//! In-memory directory store
//!
//! Holds account rows and delivers notifications between subscribers of the
//! same channel, like a database would. Used when embedding the registrar
//! without a database and by the synchronization tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{RegistrarError, Result};
use crate::sync::store::{ChangeFeed, DirectoryStore, ExtensionRow};

const FEED_CAPACITY: usize = 64;

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<ExtensionRow>>,
    published: Mutex<Vec<(String, String)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    fail_queries: AtomicBool,
    refuse_subscriptions: AtomicBool,
    loads: AtomicUsize,
    session_limit: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the account rows
    pub fn set_rows(&self, rows: Vec<ExtensionRow>) {
        *self.rows.lock() = rows;
    }

    /// Make subsequent loads fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }

    /// Make subsequent subscriptions fail
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    /// Every `(channel, payload)` published so far, in order
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Number of load queries executed
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Last session limit requested by the synchronizer; 0 if never set
    pub fn session_limit(&self) -> usize {
        self.session_limit.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn load_extensions(&self) -> Result<Vec<ExtensionRow>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(RegistrarError::StoreError("connection refused".to_string()));
        }
        Ok(self.rows.lock().clone())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.published
            .lock()
            .push((channel.to_string(), payload.to_string()));
        // No subscribers is not an error
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>> {
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(RegistrarError::ListenerUnavailable("connection refused".to_string()));
        }
        Ok(Box::new(MemoryFeed {
            rx: self.sender(channel).subscribe(),
        }))
    }

    fn set_session_limit(&self, sessions: usize) {
        self.session_limit.store(sessions, Ordering::SeqCst);
    }
}

struct MemoryFeed {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self) -> Result<Option<String>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                // Coarse invalidation: a missed notification is covered by the next one
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe("extensions").await.unwrap();
        assert_eq!(store.subscriber_count("extensions"), 1);

        store.publish("extensions", "changed").await.unwrap();
        assert_eq!(feed.next().await.unwrap().as_deref(), Some("changed"));
        assert_eq!(store.published(), vec![("extensions".to_string(), "changed".to_string())]);

        drop(feed);
        assert_eq!(store.subscriber_count("extensions"), 0);
    }

    #[tokio::test]
    async fn test_failures() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.load_extensions().await.is_err());
        store.set_failing(false);
        assert!(store.load_extensions().await.unwrap().is_empty());
        assert_eq!(store.load_count(), 2);

        store.refuse_subscriptions(true);
        let err = store.subscribe("extensions").await.err().unwrap();
        assert!(err.is_fatal());
    }
}
