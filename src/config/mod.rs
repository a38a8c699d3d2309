//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! controller.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ControllerConfig (validated, immutable)
//!
//! listen-configs/*.toml (the store)
//!     watcher.rs detects change
//!     → FileStore::refresh diffs the directory
//!     → ConfigEvent per changed document
//!     → reconciler
//! ```
//!
//! # Design Decisions
//! - Process config is immutable once loaded; ports never change at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    AcmeConfig, ControllerConfig, ListenerConfig, ObservabilityConfig, ReconcileConfig,
    StoreConfig,
};
