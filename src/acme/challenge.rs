//! HTTP-01 challenge bookkeeping and the responder served on the plain
//! socket while automated certificates are active.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use dashmap::DashMap;
use tower_http::trace::TraceLayer;
use tracing::{debug, trace};

use crate::http::redirect::https_redirect;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges, token -> key authorization.
///
/// Clones share the same table, so the issuer and the plain-HTTP responder
/// see each other's updates.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge.
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove a completed or abandoned challenge.
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Key authorization for `token`, if registered.
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

/// Router for the plain socket in automated-certificate mode.
///
/// Challenge paths are answered from `challenges`; everything else gets the
/// HTTPS redirect.
pub fn challenge_router(challenges: ChallengeManager) -> Router {
    Router::new()
        .route(&format!("{ACME_CHALLENGE_PREFIX}{{token}}"), any(respond))
        .fallback(https_redirect)
        .with_state(challenges)
        .layer(TraceLayer::new_for_http())
}

async fn respond(State(challenges): State<ChallengeManager>, Path(token): Path<String>) -> Response {
    match challenges.get_response(&token) {
        Some(key_authorization) => (StatusCode::OK, key_authorization).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown challenge token\n").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request},
    };
    use tower::ServiceExt;

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "example.com")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn add_get_remove() {
        let manager = ChallengeManager::new();
        manager.add_challenge("token", "token.thumb");
        assert_eq!(manager.get_response("token"), Some("token.thumb".to_string()));
        assert_eq!(manager.pending_count(), 1);

        manager.remove_challenge("token");
        assert_eq!(manager.get_response("token"), None);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn clones_share_state() {
        let a = ChallengeManager::new();
        let b = a.clone();
        a.add_challenge("token", "auth");
        assert_eq!(b.get_response("token"), Some("auth".to_string()));
    }

    #[tokio::test]
    async fn serves_registered_tokens() {
        let manager = ChallengeManager::new();
        manager.add_challenge("abc", "abc.thumb");
        let res = challenge_router(manager)
            .oneshot(request(Method::GET, "/.well-known/acme-challenge/abc"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"abc.thumb");
    }

    #[tokio::test]
    async fn unknown_tokens_are_not_found() {
        let res = challenge_router(ChallengeManager::new())
            .oneshot(request(Method::GET, "/.well-known/acme-challenge/nope"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_paths_redirect() {
        let res = challenge_router(ChallengeManager::new())
            .oneshot(request(Method::GET, "/index.html"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(
            res.headers()[header::LOCATION],
            "https://example.com/index.html"
        );
    }
}
