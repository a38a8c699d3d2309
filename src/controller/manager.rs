//! The listener state machine.
//!
//! Owns every listening socket and the server behind it. Only
//! [`ListenerManager::enable`], [`ListenerManager::disable`] and
//! [`ListenerManager::shutdown`] change what is served.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::state::{ListenerState, ServingState};
use super::ControllerError;
use crate::acme::{challenge_router, AcmeManager, CertificateIssuer, DirCache};
use crate::config::{AcmeConfig, ListenerConfig};
use crate::http::{application_router, redirect_router, serve, HandlerSlot, ServingSocket, SocketRole, Transport};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{self, ALPN_PROTOCOLS};
use crate::observability::metrics;
use crate::store::{ListenConfig, ListenMode};

/// Addresses and limits fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub http_address: String,
    pub https_address: String,
    pub max_connections: usize,
    pub drain_timeout: Duration,
}

impl From<&ListenerConfig> for ListenerSettings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            http_address: config.http_address(),
            https_address: config.https_address(),
            max_connections: config.max_connections,
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// Where automated certificates come from and where they are kept.
#[derive(Clone)]
pub struct AcmeSettings {
    pub issuer: Arc<dyn CertificateIssuer>,
    pub cache_dir: PathBuf,
    pub renew_before: chrono::Duration,
}

impl AcmeSettings {
    pub fn new(config: &AcmeConfig, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            issuer,
            cache_dir: PathBuf::from(&config.cache_dir),
            renew_before: chrono::Duration::days(i64::from(config.renew_before_days)),
        }
    }
}

pub struct ListenerManager {
    settings: ListenerSettings,
    handler: HandlerSlot,
    state: Arc<ListenerState>,
    acme: Arc<AcmeManager>,
    /// Held for the whole teardown + rebuild so reloads never interleave.
    sockets: Mutex<Vec<ServingSocket>>,
    reloads: AtomicU64,
}

impl ListenerManager {
    pub fn new(settings: ListenerSettings, handler: HandlerSlot, acme: AcmeSettings) -> Self {
        let state = Arc::new(ListenerState::new());
        let acme = Arc::new(AcmeManager::new(
            state.clone(),
            acme.issuer,
            DirCache::new(acme.cache_dir),
            acme.renew_before,
        ));
        Self {
            settings,
            handler,
            state,
            acme,
            sockets: Mutex::new(Vec::new()),
            reloads: AtomicU64::new(0),
        }
    }

    /// Offer `config` as the active configuration.
    ///
    /// Returns `Ok(false)` when an earlier-created configuration is active.
    /// Otherwise the candidate becomes (or stays) active; sockets are rebuilt
    /// only when nothing was active or the mode changed.
    pub async fn enable(&self, config: &ListenConfig) -> Result<bool, ControllerError> {
        let mut sockets = self.sockets.lock().await;

        let needs_reload = {
            let mut state = self.state.lock();
            if state.outranks(config) {
                debug!(id = %config.id, "Configuration not effective, an earlier one is active");
                return Ok(false);
            }

            let certificate = match config.key_pair_pem() {
                Some((cert, key)) => Some(tls::load_key_pair(cert, key)?),
                None => None,
            };
            state.adopt(config, certificate);

            let needs_reload = state.active.is_none() || state.mode != Some(config.mode);
            if !needs_reload {
                state.active = Some(config.clone());
            }
            needs_reload
        };

        if needs_reload {
            self.reload(&mut sockets, config).await?;
        }
        Ok(true)
    }

    /// Forget `config` if it is the active configuration.
    ///
    /// Sockets keep running until the next reload or shutdown.
    pub fn disable(&self, config: &ListenConfig) {
        let mut state = self.state.lock();
        if state.active.as_ref().is_some_and(|active| active.id == config.id) {
            info!(id = %config.id, "Active configuration disabled");
            state.active = None;
        }
    }

    /// Close every socket and let their servers drain in the background.
    ///
    /// Returns the first close error; sockets after it are dropped without
    /// waiting for their accept loops.
    pub async fn shutdown(&self) -> Result<(), ListenerError> {
        let mut sockets = self.sockets.lock().await;
        self.teardown(&mut sockets).await
    }

    /// The application router, if one is installed.
    pub fn current_handler(&self) -> Option<Router> {
        self.handler.current()
    }

    pub fn state(&self) -> ServingState {
        self.state.serving_state()
    }

    pub fn listener_state(&self) -> &Arc<ListenerState> {
        &self.state
    }

    pub fn active_config(&self) -> Option<ListenConfig> {
        self.state.active_config()
    }

    /// Number of completed reloads since construction.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Bound addresses of the serving sockets, in start order.
    pub async fn local_addrs(&self) -> Vec<(SocketRole, SocketAddr)> {
        self.sockets
            .lock()
            .await
            .iter()
            .map(|s| (s.role(), s.local_addr()))
            .collect()
    }

    async fn teardown(&self, sockets: &mut Vec<ServingSocket>) -> Result<(), ListenerError> {
        let mut result = Ok(());
        let mut servers = Vec::with_capacity(sockets.len());

        for serving in sockets.drain(..) {
            let (socket, server) = serving.into_parts();
            if result.is_ok() {
                let addr = socket.local_addr();
                if let Err(e) = socket.close().await {
                    warn!(address = %addr, error = %e, "Failed to close socket");
                    result = Err(e);
                }
            }
            servers.push(server);
        }

        for server in servers {
            tokio::spawn(server.shutdown());
        }

        self.state.lock().mode = None;
        metrics::set_serving_sockets(0);
        result
    }

    async fn reload(
        &self,
        sockets: &mut Vec<ServingSocket>,
        config: &ListenConfig,
    ) -> Result<(), ControllerError> {
        self.teardown(sockets).await?;

        let app = application_router(self.handler.clone());
        match config.mode {
            ListenMode::Http => {
                let listener = self.bind(&self.settings.http_address).await?;
                sockets.push(self.start(listener, SocketRole::Http, Transport::Plain, app));
            }
            ListenMode::Https => {
                let tls_config = tls::server_config(self.state.clone(), &ALPN_PROTOCOLS)?;
                let listener = self.bind(&self.settings.https_address).await?;
                sockets.push(self.start(
                    listener,
                    SocketRole::Https,
                    Transport::Tls(TlsAcceptor::from(tls_config)),
                    app,
                ));

                let listener = self.bind(&self.settings.http_address).await?;
                sockets.push(self.start(listener, SocketRole::Redirect, Transport::Plain, redirect_router()));
            }
            ListenMode::Acme => {
                let listener = self.bind(&self.settings.https_address).await?;
                sockets.push(self.start(
                    listener,
                    SocketRole::Https,
                    Transport::Acme(self.acme.clone()),
                    app,
                ));

                let listener = self.bind(&self.settings.http_address).await?;
                let challenges = challenge_router(self.acme.challenges().clone());
                sockets.push(self.start(listener, SocketRole::Redirect, Transport::Plain, challenges));
            }
        }

        {
            let mut state = self.state.lock();
            state.mode = Some(config.mode);
            state.active = Some(config.clone());
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        metrics::record_listener_reload(config.mode.as_str());
        metrics::set_serving_sockets(sockets.len());
        info!(id = %config.id, mode = %config.mode, sockets = sockets.len(), "Listener reloaded");
        Ok(())
    }

    async fn bind(&self, addr: &str) -> Result<Listener, ListenerError> {
        Listener::bind(addr, self.settings.max_connections).await
    }

    fn start(&self, listener: Listener, role: SocketRole, transport: Transport, app: Router) -> ServingSocket {
        serve(listener, role, transport, app, self.settings.drain_timeout)
    }
}
