//! Listener reconciliation.
//!
//! # Data Flow
//! ```text
//! ConfigEvent (store / watcher / resync)
//!     → reconciler.rs (enabled? precedence? failover, certificate metadata)
//!     → manager.rs (enable / disable, teardown + rebuild on mode change)
//!     → state.rs (snapshot read by TLS handshakes and the ACME policy)
//! ```

pub mod manager;
pub mod reconciler;
pub mod state;

use thiserror::Error;

use crate::cert::CertError;
use crate::net::{ListenerError, TlsError};
use crate::store::StoreError;

pub use manager::{AcmeSettings, ListenerManager, ListenerSettings};
pub use reconciler::Reconciler;
pub use state::{ListenerState, ServingState};

/// Errors surfaced while reconciling a configuration.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid TLS material: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to inspect certificate: {0}")]
    Inspect(#[from] CertError),
}
