//! Listen controller daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!   listen-configs/*.toml ──▶ FileStore ──▶ ConfigWatcher ──┐
//!                                                           ▼
//!                                                      Reconciler
//!                                                           │ enable / disable
//!                                                           ▼
//!   ┌──────────────────────── ListenerManager ─────────────────────────┐
//!   │  http   : :80  application                                       │
//!   │  https  : :443 TLS (static cert) + :80 redirect                  │
//!   │  acme   : :443 TLS (ACME cert)   + :80 HTTP-01 responder/redirect│
//!   └──────────────────────────────────────────────────────────────────┘
//!                                 │ per request
//!                                 ▼
//!                            HandlerSlot (503 until installed)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use serde_json::json;

use listen_controller::acme::{AcmeIssuer, DirCache};
use listen_controller::cert::X509Inspector;
use listen_controller::config::loader::{load_config, ConfigError};
use listen_controller::config::validation::validate_config;
use listen_controller::config::watcher::ConfigWatcher;
use listen_controller::config::ControllerConfig;
use listen_controller::controller::{AcmeSettings, ListenerManager, ListenerSettings, Reconciler};
use listen_controller::http::HandlerSlot;
use listen_controller::lifecycle::{wait_for_termination, Shutdown};
use listen_controller::observability::{init_logging, metrics};
use listen_controller::store::FileStore;

#[derive(Parser)]
#[command(name = "listen-controller")]
#[command(about = "Serve HTTP/HTTPS according to listen configurations", long_about = None)]
struct Cli {
    /// Controller configuration file (defaults apply if it does not exist).
    #[arg(short, long, default_value = "controller.toml")]
    config: PathBuf,

    /// Override `listener.http_port`.
    #[arg(long)]
    http_port: Option<u16>,

    /// Override `listener.https_port`.
    #[arg(long)]
    https_port: Option<u16>,
}

fn load(cli: &Cli) -> Result<ControllerConfig, ConfigError> {
    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        ControllerConfig::default()
    };
    if let Some(port) = cli.http_port {
        config.listener.http_port = port;
    }
    if let Some(port) = cli.https_port {
        config.listener.https_port = port;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn status_router(listeners: Arc<ListenerManager>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(status))
        .with_state(listeners)
}

async fn status(State(listeners): State<Arc<ListenerManager>>) -> Json<serde_json::Value> {
    let active = listeners.active_config();
    Json(json!({
        "state": format!("{:?}", listeners.state()),
        "active": active.as_ref().map(|c| c.id.as_str()),
        "mode": active.as_ref().map(|c| c.mode.as_str()),
        "reloads": listeners.reload_count(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(&cli)?;

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "listen-controller starting");
    tracing::info!(
        http_address = %config.listener.http_address(),
        https_address = %config.listener.https_address(),
        store = %config.store.path,
        acme_directory = %config.acme.directory_url,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = Arc::new(FileStore::open(Path::new(&config.store.path))?);
    let (watcher, events) = ConfigWatcher::new(Arc::clone(&store));
    let _watcher = watcher.run()?;

    let handler = HandlerSlot::new();
    let issuer = Arc::new(AcmeIssuer::new(
        config.acme.directory_url.clone(),
        config.acme.contact.clone(),
        DirCache::new(&config.acme.cache_dir),
    ));
    let listeners = Arc::new(ListenerManager::new(
        ListenerSettings::from(&config.listener),
        handler.clone(),
        AcmeSettings::new(&config.acme, issuer),
    ));
    handler.install(status_router(Arc::clone(&listeners)));

    let shutdown = Shutdown::new();
    let reconciler = Reconciler::new(store, Arc::clone(&listeners), Arc::new(X509Inspector));
    let reconcile_task = tokio::spawn(reconciler.run(
        events,
        shutdown.subscribe(),
        config.reconcile.resync_interval(),
    ));

    wait_for_termination().await;
    tracing::info!("Shutting down");
    shutdown.trigger();
    if let Err(e) = reconcile_task.await {
        tracing::error!(error = %e, "Reconciler task failed");
    }

    handler.clear();
    if let Err(e) = listeners.shutdown().await {
        tracing::error!(error = %e, "Failed to close listeners");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
