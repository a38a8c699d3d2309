//! HTTP serving subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::Listener)
//!     → server.rs (accept loop, TLS per transport, hyper connection)
//!     → handler.rs (application router looked up per request, 503 if none)
//!       or redirect.rs (plain socket next to a TLS socket)
//! ```

pub mod handler;
pub mod redirect;
pub mod server;

pub use handler::{application_router, HandlerSlot};
pub use redirect::{https_redirect, mangle_port, redirect_router};
pub use server::{serve, BoundSocket, HttpServer, ServingSocket, SocketRole, Transport};
