//! Snapshot of the active configuration consulted by handshakes.
//!
//! Written by `ListenerManager::enable`/`disable`/reload, read concurrently by
//! certificate selection, the ACME host policy and the terms prompt. The lock
//! is never held across an `.await`.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::acme::{AcmeError, AcmePolicy};
use crate::store::{ListenConfig, ListenMode};

/// What is being served right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    Inactive,
    Http,
    HttpsStatic,
    HttpsAcme,
}

impl From<Option<ListenMode>> for ServingState {
    fn from(mode: Option<ListenMode>) -> Self {
        match mode {
            None => ServingState::Inactive,
            Some(ListenMode::Http) => ServingState::Http,
            Some(ListenMode::Https) => ServingState::HttpsStatic,
            Some(ListenMode::Acme) => ServingState::HttpsAcme,
        }
    }
}

#[derive(Default)]
pub(crate) struct Snapshot {
    pub(crate) active: Option<ListenConfig>,
    pub(crate) mode: Option<ListenMode>,
    pub(crate) certificate: Option<Arc<CertifiedKey>>,
    domains: HashSet<String>,
    terms: Vec<String>,
    accept_all_terms: bool,
}

impl Snapshot {
    /// Take domains, terms and (if given) the certificate from `config`.
    ///
    /// The previous certificate is kept when the configuration carries none.
    pub(crate) fn adopt(&mut self, config: &ListenConfig, certificate: Option<Arc<CertifiedKey>>) {
        self.domains = config.domains.iter().map(|d| normalize_domain(d)).collect();
        self.terms = config.terms_accepted.clone();
        self.accept_all_terms = config.accepts_all_terms();
        if certificate.is_some() {
            self.certificate = certificate;
        }
    }

    /// Whether `candidate` must yield to the active configuration.
    pub(crate) fn outranks(&self, candidate: &ListenConfig) -> bool {
        self.active.as_ref().is_some_and(|active| {
            (active.created_at, &active.id) < (candidate.created_at, &candidate.id)
        })
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// Shared listener state.
#[derive(Default)]
pub struct ListenerState {
    inner: Mutex<Snapshot>,
}

impl ListenerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.inner.lock()
    }

    pub fn serving_state(&self) -> ServingState {
        self.lock().mode.into()
    }

    pub fn active_config(&self) -> Option<ListenConfig> {
        self.lock().active.clone()
    }

    /// Key pair presented by static TLS sockets.
    pub fn current_certificate(&self) -> Option<Arc<CertifiedKey>> {
        self.lock().certificate.clone()
    }
}

impl std::fmt::Debug for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.lock();
        f.debug_struct("ListenerState")
            .field("active", &snapshot.active.as_ref().map(|c| c.id.as_str()))
            .field("mode", &snapshot.mode)
            .field("has_certificate", &snapshot.certificate.is_some())
            .field("domains", &snapshot.domains)
            .finish()
    }
}

impl ResolvesServerCert for ListenerState {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current_certificate()
    }
}

impl AcmePolicy for ListenerState {
    fn check_host(&self, host: &str) -> Result<(), AcmeError> {
        if self.lock().domains.contains(host) {
            Ok(())
        } else {
            Err(AcmeError::HostNotAllowed(host.to_string()))
        }
    }

    fn accepts_terms(&self, terms_url: &str) -> bool {
        let snapshot = self.lock();
        snapshot.accept_all_terms || snapshot.terms.iter().any(|t| t == terms_url)
    }
}
