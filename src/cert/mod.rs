//! Certificate material handling.
//!
//! # Data Flow
//! ```text
//! ListenConfig { cert, ca_certs, key }
//!     → info.rs (PEM → X.509 → CertificateInfo)
//!     → reconciler compares serial numbers
//!     → store.update() only when the serial changed
//! ```

pub mod info;

pub use info::{not_after, CertError, CertificateInfo, CertificateInspector, X509Inspector};
