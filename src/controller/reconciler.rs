//! Turns configuration events into listener transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{ControllerError, ListenerManager};
use crate::cert::CertificateInspector;
use crate::observability::metrics;
use crate::store::{ConfigEvent, ConfigStore, ListenConfig};

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    listeners: Arc<ListenerManager>,
    inspector: Arc<dyn CertificateInspector>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        listeners: Arc<ListenerManager>,
        inspector: Arc<dyn CertificateInspector>,
    ) -> Self {
        Self {
            store,
            listeners,
            inspector,
        }
    }

    /// Apply one change notification.
    ///
    /// Enabled configurations are offered to the listener. A disabled (or
    /// tombstoned) configuration is relinquished and the earliest-created
    /// remaining candidate is activated in its place.
    pub async fn sync(&self, event: &ConfigEvent) -> Result<(), ControllerError> {
        let Some(config) = &event.config else {
            debug!(key = %event.key, "Configuration gone, nothing to do");
            return Ok(());
        };

        if config.is_candidate() {
            return self.activate(config).await;
        }

        self.listeners.disable(config);

        let replacement = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|c| c.is_candidate() && c.id != config.id)
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        if let Some(replacement) = replacement {
            info!(disabled = %config.id, replacement = %replacement.id, "Failing over to remaining enabled configuration");
            self.activate(&replacement).await?;
        }
        Ok(())
    }

    async fn activate(&self, config: &ListenConfig) -> Result<(), ControllerError> {
        if self.listeners.enable(config).await? {
            self.update_current(config).await?;
        }
        Ok(())
    }

    /// Persist certificate metadata for the active configuration when its
    /// serial number changed. Returns whether the store was written.
    pub async fn update_current(&self, config: &ListenConfig) -> Result<bool, ControllerError> {
        if config.key.is_empty() || config.cert.is_empty() || config.ca_certs.is_empty() {
            return Ok(false);
        }

        let chain = format!("{}\n{}", config.cert, config.ca_certs);
        let info = self.inspector.inspect(&chain, &config.key)?;
        if info.serial_number == config.certificate.serial_number {
            return Ok(false);
        }

        // Skip if the stored copy moved on; its own event will follow.
        let Some(mut latest) = self.store.get(&config.id).await? else {
            return Ok(false);
        };
        if latest.cert != config.cert || latest.ca_certs != config.ca_certs || latest.key != config.key {
            debug!(id = %config.id, "Certificate changed since event, skipping metadata update");
            return Ok(false);
        }

        info!(
            id = %config.id,
            serial_number = %info.serial_number,
            expires_at = %info.expires_at,
            "Recording certificate metadata"
        );
        latest.certificate = info;
        self.store.update(latest).await?;
        Ok(true)
    }

    /// Re-run `sync` for every stored configuration, earliest first.
    pub async fn resync(&self) -> Result<(), ControllerError> {
        let mut configs = self.store.list().await?;
        configs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        for config in configs {
            let event = ConfigEvent::changed(config);
            if let Err(e) = self.sync(&event).await {
                warn!(key = %event.key, error = %e, "Resync failed for configuration");
            }
        }
        Ok(())
    }

    /// Process events one at a time until shutdown, resyncing periodically.
    ///
    /// The first resync runs immediately.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ConfigEvent>,
        mut shutdown: broadcast::Receiver<()>,
        resync_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle(&event).await,
                    None => {
                        warn!("Configuration event stream closed, relying on resync");
                        events_open = false;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        error!(error = %e, "Resync failed");
                    }
                }
            }
        }
        debug!("Reconciler stopped");
    }

    async fn handle(&self, event: &ConfigEvent) {
        match self.sync(event).await {
            Ok(()) => metrics::record_reconcile_event("ok"),
            Err(e) => {
                metrics::record_reconcile_event("error");
                error!(key = %event.key, error = %e, "Failed to reconcile configuration");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::acme::{AcmeError, AcmePolicy, CertificateIssuer, ChallengeManager, StoredCertificate};
    use crate::cert::info::test_support::self_signed;
    use crate::cert::X509Inspector;
    use crate::controller::{AcmeSettings, ListenerSettings, ServingState};
    use crate::http::HandlerSlot;
    use crate::store::{ListenMode, MemoryStore};

    struct NoIssuer;

    #[async_trait]
    impl CertificateIssuer for NoIssuer {
        async fn issue(
            &self,
            domain: &str,
            _challenges: &ChallengeManager,
            _policy: &dyn AcmePolicy,
        ) -> Result<StoredCertificate, AcmeError> {
            Err(AcmeError::Order(format!("no issuer for {}", domain)))
        }
    }

    fn setup(store: &MemoryStore) -> (Reconciler, Arc<ListenerManager>, tempfile::TempDir) {
        let cache = tempfile::tempdir().unwrap();
        let listeners = Arc::new(ListenerManager::new(
            ListenerSettings {
                http_address: "127.0.0.1:0".into(),
                https_address: "127.0.0.1:0".into(),
                max_connections: 64,
                drain_timeout: std::time::Duration::from_millis(200),
            },
            HandlerSlot::new(),
            AcmeSettings {
                issuer: Arc::new(NoIssuer),
                cache_dir: cache.path().to_path_buf(),
                renew_before: ChronoDuration::days(30),
            },
        ));
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::clone(&listeners),
            Arc::new(X509Inspector),
        );
        (reconciler, listeners, cache)
    }

    fn https_config(created_at: chrono::DateTime<Utc>) -> ListenConfig {
        let (cert, key) = self_signed(&["localhost"]);
        let mut config = ListenConfig::new(ListenMode::Https, created_at);
        config.ca_certs = cert.clone();
        config.cert = cert;
        config.key = key;
        config
    }

    #[tokio::test]
    async fn absent_configuration_is_a_no_op() {
        let store = MemoryStore::new();
        let (reconciler, listeners, _cache) = setup(&store);
        reconciler.sync(&ConfigEvent::removed("gone")).await.unwrap();
        assert_eq!(listeners.state(), ServingState::Inactive);
        assert_eq!(listeners.reload_count(), 0);
    }

    #[tokio::test]
    async fn disable_fails_over_to_remaining_enabled_configuration() {
        let store = MemoryStore::new();
        let (reconciler, listeners, _cache) = setup(&store);
        let now = Utc::now();

        let a = ListenConfig::new(ListenMode::Http, now);
        let b = https_config(now + ChronoDuration::seconds(1));
        store.apply(a.clone());
        store.apply(b.clone());

        reconciler.sync(&ConfigEvent::changed(a.clone())).await.unwrap();
        reconciler.sync(&ConfigEvent::changed(b.clone())).await.unwrap();
        assert_eq!(listeners.state(), ServingState::Http);
        assert_eq!(listeners.active_config().unwrap().id, a.id);

        let mut disabled = a.clone();
        disabled.enabled = false;
        store.apply(disabled.clone());
        reconciler.sync(&ConfigEvent::changed(disabled)).await.unwrap();

        assert_eq!(listeners.state(), ServingState::HttpsStatic);
        assert_eq!(listeners.active_config().unwrap().id, b.id);
        assert_eq!(listeners.local_addrs().await.len(), 2);
        listeners.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tombstoned_configuration_is_relinquished() {
        let store = MemoryStore::new();
        let (reconciler, listeners, _cache) = setup(&store);
        let a = ListenConfig::new(ListenMode::Http, Utc::now());
        store.apply(a.clone());
        reconciler.sync(&ConfigEvent::changed(a.clone())).await.unwrap();

        let mut deleted = a.clone();
        deleted.deleted_at = Some(Utc::now());
        reconciler.sync(&ConfigEvent::changed(deleted)).await.unwrap();
        assert!(listeners.active_config().is_none());
        listeners.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn certificate_metadata_is_persisted_once_per_serial() {
        let store = MemoryStore::new();
        let (reconciler, listeners, _cache) = setup(&store);
        let config = https_config(Utc::now());
        store.apply(config.clone());

        reconciler.sync(&ConfigEvent::changed(config.clone())).await.unwrap();
        let stored = store.get(&config.id).await.unwrap().unwrap();
        assert!(!stored.certificate.serial_number.is_empty());
        assert_eq!(stored.certificate.common_name, "localhost");

        // The echoed event carries the recorded serial; nothing more to write.
        assert!(!reconciler.update_current(&stored).await.unwrap());
        listeners.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn metadata_requires_a_ca_bundle() {
        let store = MemoryStore::new();
        let (reconciler, _listeners, _cache) = setup(&store);
        let mut config = https_config(Utc::now());
        config.ca_certs.clear();
        store.apply(config.clone());
        assert!(!reconciler.update_current(&config).await.unwrap());
    }
}
