//! Configuration schema definitions.
//!
//! This module defines the process-level configuration for the controller.
//! All types derive Serde traits for deserialization from config files.
//! Listen configurations themselves live in the store, not here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the listen controller.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControllerConfig {
    /// Ports and socket limits.
    pub listener: ListenerConfig,

    /// Automated certificate settings.
    pub acme: AcmeConfig,

    /// Where listen configurations are read from.
    pub store: StoreConfig,

    /// Reconcile loop settings.
    pub reconcile: ReconcileConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration. Fixed for the process lifetime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host part of every bind address (e.g., "0.0.0.0").
    pub bind_host: String,

    /// Plain HTTP port.
    pub http_port: u16,

    /// TLS port.
    pub https_port: u16,

    /// Maximum concurrent connections per socket (backpressure).
    pub max_connections: usize,

    /// How long a stopped server waits for in-flight connections.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            http_port: 80,
            https_port: 443,
            max_connections: 10_000,
            drain_timeout_secs: 30,
        }
    }
}

impl ListenerConfig {
    pub fn http_address(&self) -> String {
        join_host_port(&self.bind_host, self.http_port)
    }

    pub fn https_address(&self) -> String {
        join_host_port(&self.bind_host, self.https_port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Automated certificate configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// ACME directory URL.
    pub directory_url: String,

    /// Account contact URIs (e.g., "mailto:ops@example.com").
    pub contact: Vec<String>,

    /// Directory holding issued certificates and account credentials.
    pub cache_dir: String,

    /// Re-issue certificates this many days before they expire.
    pub renew_before_days: u32,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            contact: Vec::new(),
            cache_dir: "certs-cache".to_string(),
            renew_before_days: 30,
        }
    }
}

/// Listen configuration store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of listen configuration documents.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "listen-configs".to_string(),
        }
    }
}

/// Reconcile loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Full resync interval in seconds.
    pub resync_interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 300,
        }
    }
}

impl ReconcileConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
