//! In-process configuration store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ConfigEvent, ConfigStore, ListenConfig, StoreError};

/// A thread-safe store keyed by configuration identity.
///
/// Every write is echoed to subscribers as a [`ConfigEvent`], the same way a
/// watch on a remote store would deliver it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, ListenConfig>>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ConfigEvent>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every change made after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConfigEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Create or replace a configuration.
    pub fn apply(&self, config: ListenConfig) {
        self.inner.insert(config.id.clone(), config.clone());
        self.publish(ConfigEvent::changed(config));
    }

    /// Delete a configuration: a tombstone first, then the removal.
    pub fn remove(&self, id: &str) -> Option<ListenConfig> {
        let (_, mut config) = self.inner.remove(id)?;
        config.deleted_at = Some(chrono::Utc::now());
        self.publish(ConfigEvent::changed(config.clone()));
        self.publish(ConfigEvent::removed(id));
        Some(config)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn publish(&self, event: ConfigEvent) {
        // Drop subscribers whose receiver went away.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ListenConfig>, StoreError> {
        Ok(self.inner.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<ListenConfig>, StoreError> {
        let mut all: Vec<_> = self.inner.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn update(&self, config: ListenConfig) -> Result<ListenConfig, StoreError> {
        if !self.inner.contains_key(&config.id) {
            return Err(StoreError::NotFound(config.id));
        }
        self.apply(config.clone());
        Ok(config)
    }
}
