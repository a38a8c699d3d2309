//! Serving sockets.
//!
//! # Responsibilities
//! - Run one accept loop per bound socket
//! - Perform the TLS handshake the socket's transport asks for
//! - Serve HTTP/1.1 and HTTP/2 with hyper on every connection
//! - Close a socket (stop accepting) independently of stopping its server
//!   (draining connections already accepted)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::acme::AcmeManager;
use crate::net::listener::{is_connection_error, Listener, ListenerError};
use crate::net::ConnectionTracker;
use crate::observability::metrics;

/// Upper bound on a TLS handshake. Certificate issuance it starts keeps
/// running past it.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// What a socket is used for. Only used for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Plain HTTP serving the application.
    Http,
    /// TLS serving the application.
    Https,
    /// Plain HTTP answering with redirects (and ACME challenges).
    Redirect,
}

impl SocketRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketRole::Http => "http",
            SocketRole::Https => "https",
            SocketRole::Redirect => "redirect",
        }
    }
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How accepted connections are turned into an HTTP byte stream.
#[derive(Clone)]
pub enum Transport {
    Plain,
    Tls(TlsAcceptor),
    Acme(Arc<AcmeManager>),
}

/// The accepting half of a serving socket.
pub struct BoundSocket {
    addr: SocketAddr,
    close_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl BoundSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and release the port.
    ///
    /// Returns once the listening socket has been dropped.
    pub async fn close(self) -> Result<(), ListenerError> {
        let _ = self.close_tx.send(());
        self.task
            .await
            .map_err(|e| ListenerError::Close(e.to_string()))
    }
}

/// The serving half: connections accepted by a socket.
pub struct HttpServer {
    role: SocketRole,
    addr: SocketAddr,
    connections: ConnectionTracker,
    drain_timeout: Duration,
}

impl HttpServer {
    /// Ask every connection to finish its in-flight requests and wait for
    /// them, up to the drain timeout.
    pub async fn shutdown(self) {
        self.connections.begin_shutdown();
        if self.connections.wait_for_drain(self.drain_timeout).await {
            tracing::debug!(role = %self.role, address = %self.addr, "Server drained");
        } else {
            tracing::warn!(
                role = %self.role,
                address = %self.addr,
                remaining = self.connections.active_count(),
                "Drain timeout reached with open connections"
            );
        }
    }
}

/// A socket and the server answering it.
pub struct ServingSocket {
    role: SocketRole,
    socket: BoundSocket,
    server: HttpServer,
}

impl ServingSocket {
    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn into_parts(self) -> (BoundSocket, HttpServer) {
        (self.socket, self.server)
    }
}

/// Start serving `app` on an already bound listener.
pub fn serve(
    listener: Listener,
    role: SocketRole,
    transport: Transport,
    app: Router,
    drain_timeout: Duration,
) -> ServingSocket {
    let addr = listener.local_addr();
    let connections = ConnectionTracker::new();
    let (close_tx, close_rx) = oneshot::channel();

    tracing::info!(role = %role, address = %addr, "Serving");

    let task = tokio::spawn(accept_loop(
        listener,
        role,
        transport,
        app,
        connections.clone(),
        close_rx,
    ));

    ServingSocket {
        role,
        socket: BoundSocket {
            addr,
            close_tx,
            task,
        },
        server: HttpServer {
            role,
            addr,
            connections,
            drain_timeout,
        },
    }
}

async fn accept_loop(
    listener: Listener,
    role: SocketRole,
    transport: Transport,
    app: Router,
    connections: ConnectionTracker,
    mut close_rx: oneshot::Receiver<()>,
) {
    let addr = listener.local_addr();
    loop {
        let accepted = tokio::select! {
            _ = &mut close_rx => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer, permit)) => {
                let guard = connections.track();
                let shutdown = connections.shutdown_receiver();
                let transport = transport.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    tracing::trace!(connection_id = %guard.id(), peer = %peer, role = %role, "Serving connection");
                    handle_connection(stream, peer, transport, app, shutdown).await;
                    drop(guard);
                });
            }
            Err(e) if is_connection_error(&e) => {
                tracing::debug!(address = %addr, error = %e, "Connection failed during accept");
            }
            Err(e) => {
                tracing::error!(role = %role, address = %addr, error = %e, "Stopped accepting connections");
                break;
            }
        }
    }
    tracing::debug!(role = %role, address = %addr, "Socket closed");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    transport: Transport,
    app: Router,
    shutdown: watch::Receiver<bool>,
) {
    match transport {
        Transport::Plain => serve_connection(stream, app, shutdown).await,
        Transport::Tls(acceptor) => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => serve_connection(tls, app, shutdown).await,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    metrics::record_handshake_rejection("handshake");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "TLS handshake timed out");
                    metrics::record_handshake_rejection("timeout");
                }
            }
        }
        Transport::Acme(manager) => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, manager.accept(stream)).await {
                Ok(Ok(tls)) => serve_connection(tls, app, shutdown).await,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "TLS handshake timed out");
                    metrics::record_handshake_rejection("timeout");
                }
            }
        }
    }
}

async fn serve_connection<IO>(io: IO, app: Router, mut shutdown: watch::Receiver<bool>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(app);
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = *shutdown.borrow_and_update();
    if draining {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Connection closed with error");
                }
                break;
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
