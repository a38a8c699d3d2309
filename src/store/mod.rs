//! Listen configuration store.
//!
//! # Data Flow
//! ```text
//! operator edits / API writes
//!     → store (memory.rs | file.rs)
//!     → ConfigEvent { key, config } on an mpsc channel
//!     → controller::Reconciler (one event at a time)
//!     → store.update() for derived certificate metadata
//! ```
//!
//! # Design Decisions
//! - The controller only sees the [`ConfigStore`] trait
//! - Deletions surface first as a tombstoned config, then as `None`
//! - Events may be delivered more than once; consumers must be idempotent

pub mod file;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use types::{ConfigEvent, ListenConfig, ListenMode, ACCEPT_ALL_TERMS};

/// Errors surfaced by a configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listen config {0} not found")]
    NotFound(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode listen config: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// The slice of the configuration store the controller consumes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch one configuration by identity.
    async fn get(&self, id: &str) -> Result<Option<ListenConfig>, StoreError>;

    /// Every known configuration, tombstoned ones included.
    async fn list(&self) -> Result<Vec<ListenConfig>, StoreError>;

    /// Replace a configuration, returning the stored copy.
    async fn update(&self, config: ListenConfig) -> Result<ListenConfig, StoreError>;
}
