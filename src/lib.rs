//! Listen configuration controller.
//!
//! Turns declarative listen configurations into live HTTP/HTTPS sockets:
//! plain HTTP, static TLS with an HTTPS redirect, or automated ACME
//! certificates with an HTTP-01 responder.

pub mod acme;
pub mod cert;
pub mod config;
pub mod controller;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod store;

pub use config::ControllerConfig;
pub use controller::{ListenerManager, Reconciler};
pub use http::HandlerSlot;
pub use lifecycle::Shutdown;
