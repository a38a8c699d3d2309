//! Listen configuration object definitions.
//!
//! These mirror the documents held by the configuration store. Everything
//! except the `certificate` block is authored by operators; the
//! `certificate` block is derived and written back by the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cert::CertificateInfo;

/// Serving mode of a listen configuration.
///
/// Unknown modes fail deserialisation instead of being silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Plain HTTP on the HTTP port.
    Http,
    /// Static TLS material on the HTTPS port, redirects on the HTTP port.
    Https,
    /// Automated certificates on the HTTPS port, HTTP-01 responder on the HTTP port.
    Acme,
}

impl ListenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenMode::Http => "http",
            ListenMode::Https => "https",
            ListenMode::Acme => "acme",
        }
    }
}

impl std::fmt::Display for ListenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Term-of-service identifiers that mean "accept whatever the CA asks".
pub const ACCEPT_ALL_TERMS: [&str; 2] = ["auto", ""];

/// A declarative description of how the process should listen.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Stable unique identity.
    #[serde(default)]
    pub id: String,

    /// Logical ordering key. The earliest enabled configuration wins.
    pub created_at: DateTime<Utc>,

    /// Tombstone set once the object is being removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub enabled: bool,

    pub mode: ListenMode,

    /// Hostnames certificates may be issued for (acme mode).
    #[serde(default)]
    pub domains: Vec<String>,

    /// Accepted terms-of-service identifiers, see [`ACCEPT_ALL_TERMS`].
    #[serde(default)]
    pub terms_accepted: Vec<String>,

    /// PEM certificate (https mode).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,

    /// PEM private key (https mode).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// PEM CA bundle appended to the chain when inspecting the certificate.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_certs: String,

    /// Derived certificate metadata. Kept last so TOML emits it as a trailing table.
    #[serde(default)]
    pub certificate: CertificateInfo,
}

impl ListenConfig {
    /// Create an enabled configuration with a fresh identity.
    pub fn new(mode: ListenMode, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at,
            deleted_at: None,
            enabled: true,
            mode,
            domains: Vec::new(),
            terms_accepted: Vec::new(),
            cert: String::new(),
            key: String::new(),
            ca_certs: String::new(),
            certificate: CertificateInfo::default(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Enabled and not tombstoned.
    pub fn is_candidate(&self) -> bool {
        self.enabled && !self.is_deleted()
    }

    /// Static certificate and key, when both are present.
    pub fn key_pair_pem(&self) -> Option<(&str, &str)> {
        if self.cert.is_empty() || self.key.is_empty() {
            return None;
        }
        Some((self.cert.as_str(), self.key.as_str()))
    }

    /// Whether the terms snapshot contains an accept-all sentinel.
    pub fn accepts_all_terms(&self) -> bool {
        self.terms_accepted
            .iter()
            .any(|t| ACCEPT_ALL_TERMS.contains(&t.as_str()))
    }
}

/// A change notification from the configuration store.
///
/// `config` is `None` once the object no longer exists.
#[derive(Debug, Clone)]
pub struct ConfigEvent {
    pub key: String,
    pub config: Option<ListenConfig>,
}

impl ConfigEvent {
    pub fn changed(config: ListenConfig) -> Self {
        Self {
            key: config.id.clone(),
            config: Some(config),
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            config: None,
        }
    }
}
