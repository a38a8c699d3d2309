//! Per-handshake certificate lookup for automated TLS.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rustls::server::Acceptor;
use rustls::sign::CertifiedKey;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use super::{AcmeError, AcmePolicy, CertificateIssuer, ChallengeManager, DirCache, StoredCertificate};
use crate::cert;
use crate::net::tls::{self, FixedCertResolver, ALPN_PROTOCOLS};
use crate::observability::metrics;

struct CachedKey {
    key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

/// Resolves, caches and (re)issues certificates for automated TLS sockets.
pub struct AcmeManager {
    policy: Arc<dyn AcmePolicy>,
    issuer: Arc<dyn CertificateIssuer>,
    cache: DirCache,
    challenges: ChallengeManager,
    renew_before: ChronoDuration,
    certificates: Arc<DashMap<String, CachedKey>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl AcmeManager {
    pub fn new(
        policy: Arc<dyn AcmePolicy>,
        issuer: Arc<dyn CertificateIssuer>,
        cache: DirCache,
        renew_before: ChronoDuration,
    ) -> Self {
        Self {
            policy,
            issuer,
            cache,
            challenges: ChallengeManager::new(),
            renew_before,
            certificates: Arc::new(DashMap::new()),
            in_flight: DashMap::new(),
        }
    }

    /// Challenges published while orders are pending.
    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Certificate to present for the given SNI value.
    ///
    /// The host policy is checked on every call. Concurrent requests for the
    /// same name share one issuance, which runs in its own task and keeps
    /// going when the handshake that started it gives up.
    pub async fn certificate_for(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, AcmeError> {
        let name = normalize_server_name(server_name)?;
        self.policy.check_host(&name)?;

        if let Some(key) = self.fresh(&name) {
            return Ok(key);
        }

        let lock = self.in_flight.entry(name.clone()).or_default().clone();
        let issuing = lock.lock_owned().await;

        // Another handshake may have finished the work while we waited.
        if let Some(key) = self.fresh(&name) {
            return Ok(key);
        }

        match self.cache.load(&name).await {
            Ok(Some(stored)) => match parse(&stored) {
                Ok(cached) => {
                    let key = Arc::clone(&cached.key);
                    let fresh = self.is_fresh(&cached);
                    self.certificates.insert(name.clone(), cached);
                    if fresh {
                        debug!(domain = %name, "Serving cached certificate");
                        return Ok(key);
                    }
                    info!(domain = %name, "Cached certificate is due for renewal");
                }
                Err(e) => warn!(domain = %name, error = %e, "Ignoring unreadable cached certificate"),
            },
            Ok(None) => {}
            Err(e) => warn!(domain = %name, error = %e, "Failed to read certificate cache"),
        }

        match self.obtain(&name, issuing).await {
            Ok(key) => Ok(key),
            Err(e) => match self.unexpired(&name) {
                Some(key) => {
                    warn!(domain = %name, error = %e, "Renewal failed, serving current certificate");
                    Ok(key)
                }
                None => Err(e),
            },
        }
    }

    /// Read the ClientHello, pick a certificate, finish the handshake.
    pub async fn accept(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let server_name = start.client_hello().server_name().map(str::to_owned);

        let key = match self.certificate_for(server_name.as_deref()).await {
            Ok(key) => key,
            Err(e) => {
                debug!(server_name = ?server_name, error = %e, "Rejecting handshake");
                metrics::record_handshake_rejection(e.rejection_reason());
                return Err(io::Error::other(e));
            }
        };

        let config = tls::server_config(Arc::new(FixedCertResolver(key)), &ALPN_PROTOCOLS)
            .map_err(io::Error::other)?;
        start.into_stream(config).await
    }

    async fn obtain(
        &self,
        name: &str,
        issuing: OwnedMutexGuard<()>,
    ) -> Result<Arc<CertifiedKey>, AcmeError> {
        let issuance = Issuance {
            policy: Arc::clone(&self.policy),
            issuer: Arc::clone(&self.issuer),
            cache: self.cache.clone(),
            challenges: self.challenges.clone(),
            certificates: Arc::clone(&self.certificates),
        };
        let name = name.to_string();
        tokio::spawn(async move {
            let result = issuance.run(&name).await;
            drop(issuing);
            result
        })
        .await
        .map_err(|e| AcmeError::Order(format!("issuance task failed: {}", e)))?
    }

    fn is_fresh(&self, cached: &CachedKey) -> bool {
        cached.not_after - self.renew_before > Utc::now()
    }

    fn fresh(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates
            .get(name)
            .filter(|c| self.is_fresh(c))
            .map(|c| Arc::clone(&c.key))
    }

    fn unexpired(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates
            .get(name)
            .filter(|c| c.not_after > Utc::now())
            .map(|c| Arc::clone(&c.key))
    }
}

/// Everything an issuance needs, detached from the handshake that asked.
struct Issuance {
    policy: Arc<dyn AcmePolicy>,
    issuer: Arc<dyn CertificateIssuer>,
    cache: DirCache,
    challenges: ChallengeManager,
    certificates: Arc<DashMap<String, CachedKey>>,
}

impl Issuance {
    async fn run(self, name: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        info!(domain = %name, "Requesting certificate");
        let issued = match self
            .issuer
            .issue(name, &self.challenges, self.policy.as_ref())
            .await
        {
            Ok(issued) => {
                metrics::record_acme_issuance("success");
                issued
            }
            Err(e) => {
                metrics::record_acme_issuance("failure");
                return Err(e);
            }
        };

        let cached = parse(&issued)?;
        if let Err(e) = self.cache.store(name, &issued).await {
            warn!(domain = %name, error = %e, "Failed to cache issued certificate");
        }
        let key = Arc::clone(&cached.key);
        self.certificates.insert(name.to_string(), cached);
        Ok(key)
    }
}

fn parse(stored: &StoredCertificate) -> Result<CachedKey, AcmeError> {
    Ok(CachedKey {
        key: tls::load_key_pair(&stored.chain_pem, &stored.key_pem)?,
        not_after: cert::not_after(&stored.chain_pem)?,
    })
}

/// Canonical form of an SNI value: lowercase, no trailing dot.
///
/// Rejects names that could not be a public domain (no dot) or that would
/// escape the cache directory.
pub fn normalize_server_name(server_name: Option<&str>) -> Result<String, AcmeError> {
    let raw = match server_name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(AcmeError::MissingServerName),
    };
    let name = raw.trim_end_matches('.').to_ascii_lowercase();
    let valid = name.contains('.')
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(AcmeError::InvalidServerName(raw.to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cert::info::test_support::self_signed;

    struct AllowList(Vec<&'static str>);

    impl AcmePolicy for AllowList {
        fn check_host(&self, host: &str) -> Result<(), AcmeError> {
            if self.0.contains(&host) {
                Ok(())
            } else {
                Err(AcmeError::HostNotAllowed(host.to_string()))
            }
        }

        fn accepts_terms(&self, _terms_url: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue(
            &self,
            domain: &str,
            _challenges: &ChallengeManager,
            _policy: &dyn AcmePolicy,
        ) -> Result<StoredCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (chain_pem, key_pem) = self_signed(&[domain]);
            Ok(StoredCertificate { chain_pem, key_pem })
        }
    }

    fn manager(dir: &std::path::Path, issuer: Arc<CountingIssuer>) -> AcmeManager {
        AcmeManager::new(
            Arc::new(AllowList(vec!["example.com"])),
            issuer,
            DirCache::new(dir),
            ChronoDuration::days(30),
        )
    }

    #[test]
    fn normalizes_server_names() {
        assert_eq!(normalize_server_name(Some("Example.COM.")).unwrap(), "example.com");
        assert!(matches!(normalize_server_name(None), Err(AcmeError::MissingServerName)));
        assert!(matches!(normalize_server_name(Some("")), Err(AcmeError::MissingServerName)));
        assert!(matches!(
            normalize_server_name(Some("localhost")),
            Err(AcmeError::InvalidServerName(_))
        ));
        assert!(matches!(
            normalize_server_name(Some("../etc.passwd")),
            Err(AcmeError::InvalidServerName(_))
        ));
    }

    #[tokio::test]
    async fn rejects_hosts_outside_policy_without_issuing() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let manager = manager(dir.path(), Arc::clone(&issuer));

        let err = manager.certificate_for(Some("other.com")).await.unwrap_err();
        assert!(matches!(err, AcmeError::HostNotAllowed(_)));
        assert_eq!(err.rejection_reason(), "host_policy");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_handshakes_share_one_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let manager = Arc::new(manager(dir.path(), Arc::clone(&issuer)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.certificate_for(Some("example.com")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_handshake_does_not_cancel_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let manager = manager(dir.path(), Arc::clone(&issuer));

        let gave_up = tokio::time::timeout(
            Duration::from_millis(5),
            manager.certificate_for(Some("example.com")),
        )
        .await;
        assert!(gave_up.is_err());

        // The next handshake joins the running issuance instead of starting one.
        manager.certificate_for(Some("example.com")).await.unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn issued_certificates_are_cached_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(CountingIssuer::default());
        manager(dir.path(), Arc::clone(&first))
            .certificate_for(Some("example.com"))
            .await
            .unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);

        // A fresh manager over the same directory finds the certificate.
        // rcgen's default validity runs to 4096, well outside the renewal window.
        let second = Arc::new(CountingIssuer::default());
        manager(dir.path(), Arc::clone(&second))
            .certificate_for(Some("example.com"))
            .await
            .unwrap();
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }
}
