//! Automated certificates via ACME.
//!
//! Certificates are obtained lazily: the first TLS handshake for an allowed
//! host name triggers issuance over HTTP-01, later handshakes are served
//! from memory or the on-disk cache until the certificate enters its
//! renewal window.
//!
//! # Data Flow
//! ```text
//! ClientHello (SNI)
//!     → manager.rs (host policy, memory cache, disk cache, single flight)
//!     → issuer.rs (account, terms prompt, order, HTTP-01, finalize)
//!     → challenge.rs (token served on the plain socket)
//!     → cache.rs (persist chain + key)
//! ```

pub mod cache;
pub mod challenge;
pub mod issuer;
pub mod manager;

use thiserror::Error;

use crate::cert::CertError;
use crate::net::TlsError;

pub use cache::{DirCache, StoredCertificate};
pub use challenge::{challenge_router, ChallengeManager};
pub use issuer::{AcmeIssuer, CertificateIssuer};
pub use manager::{normalize_server_name, AcmeManager};

/// Errors from certificate automation.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("missing server name")]
    MissingServerName,

    #[error("server name {0:?} is not a valid domain")]
    InvalidServerName(String),

    #[error("host {0:?} not configured")]
    HostNotAllowed(String),

    #[error("terms of service {0} not accepted")]
    TermsNotAccepted(String),

    #[error("acme protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("acme order failed: {0}")]
    Order(String),

    #[error("failed to build certificate request: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("failed to fetch acme directory: {0}")]
    Directory(#[from] reqwest::Error),

    #[error("invalid account credentials: {0}")]
    Credentials(#[from] serde_json::Error),

    #[error("certificate cache error: {0}")]
    Cache(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Certificate(#[from] CertError),
}

impl AcmeError {
    /// Metric label used when this error aborts a handshake.
    pub fn rejection_reason(&self) -> &'static str {
        match self {
            AcmeError::MissingServerName => "missing_server_name",
            AcmeError::InvalidServerName(_) | AcmeError::HostNotAllowed(_) => "host_policy",
            AcmeError::TermsNotAccepted(_) => "terms",
            _ => "issuance",
        }
    }
}

/// Decisions the certificate machinery delegates to its owner.
///
/// Both are consulted on every use so that configuration changes apply to
/// the next handshake without rebuilding anything.
pub trait AcmePolicy: Send + Sync {
    /// `Ok(())` when a certificate may be served for `host`.
    fn check_host(&self, host: &str) -> Result<(), AcmeError>;

    /// Whether the CA's terms of service at `terms_url` are accepted.
    fn accepts_terms(&self, terms_url: &str) -> bool;
}
