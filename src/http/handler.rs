//! Application handler indirection.
//!
//! Sockets are started before (and independently of) the application
//! router. Each request looks up whatever router is installed right now and
//! answers `503 Service Unavailable` when there is none.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Router,
};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

/// Holder for the live application router.
#[derive(Clone, Default)]
pub struct HandlerSlot {
    current: Arc<ArcSwapOption<Router>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the application router.
    pub fn install(&self, router: Router) {
        self.current.store(Some(Arc::new(router)));
    }

    /// Remove the application router; requests get 503 until the next install.
    pub fn clear(&self) {
        self.current.store(None);
    }

    /// The router requests are dispatched to, if any.
    pub fn current(&self) -> Option<Router> {
        self.current.load_full().map(|router| (*router).clone())
    }
}

/// Router served on application sockets.
pub fn application_router(slot: HandlerSlot) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(slot)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(slot): State<HandlerSlot>, request: Request) -> Response {
    match slot.current() {
        Some(router) => match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        },
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
