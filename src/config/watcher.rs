//! Listen configuration directory watcher.

use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::store::{ConfigEvent, FileStore};

/// Watches a [`FileStore`] directory and forwards store changes.
pub struct ConfigWatcher {
    store: Arc<FileStore>,
    update_tx: mpsc::UnboundedSender<ConfigEvent>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration events.
    pub fn new(store: Arc<FileStore>) -> (Self, mpsc::UnboundedReceiver<ConfigEvent>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (Self { store, update_tx }, update_rx)
    }

    /// Start watching the directory in a background thread.
    ///
    /// The returned watcher must be kept alive for events to flow.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let store = Arc::clone(&self.store);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_access() {
                        return;
                    }
                    match store.refresh() {
                        Ok(changes) => {
                            for change in changes {
                                tracing::debug!(key = %change.key, "Listen config change detected");
                                let _ = tx.send(change);
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to rescan listen configs; keeping previous view");
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(self.store.root(), RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.store.root().display(), "Listen config watcher started");
        Ok(watcher)
    }
}
