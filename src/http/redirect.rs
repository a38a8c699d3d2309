//! Plain-HTTP to HTTPS redirection.
//!
//! GET and HEAD are redirected; any other method gets a 400.
//! The port of the redirect target is remapped with `port / 1000 + 443`.

use axum::{
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tower_http::trace::TraceLayer;

/// Router that answers every request with a redirect (or a 400).
pub fn redirect_router() -> Router {
    Router::new()
        .fallback(https_redirect)
        .layer(TraceLayer::new_for_http())
}

/// Redirect GET/HEAD to the HTTPS equivalent URL, reject other methods.
pub async fn https_redirect(method: Method, headers: HeaderMap, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::BAD_REQUEST, "Use HTTPS\n").into_response();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let request_uri = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = format!("https://{}{}", mangle_port(&host), request_uri);

    (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
}

/// Remap the port of `host:port` to `port / 1000 + 443`.
///
/// Input that does not split into a host and a numeric port is returned
/// unchanged.
pub fn mangle_port(hostport: &str) -> String {
    let Some((host, port)) = split_host_port(hostport) else {
        return hostport.to_string();
    };
    let Ok(port) = port.parse::<i64>() else {
        return hostport.to_string();
    };
    join_host_port(host, port / 1000 + 443)
}

fn split_host_port(hostport: &str) -> Option<(&str, &str)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = hostport.rsplit_once(':')?;
    if host.contains(':') {
        // Unbracketed IPv6 literal
        return None;
    }
    Some((host, port))
}

fn join_host_port(host: &str, port: i64) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    #[test]
    fn mangles_ports() {
        assert_eq!(mangle_port("example.com:8081"), "example.com:451");
        assert_eq!(mangle_port("example.com:80"), "example.com:443");
        assert_eq!(mangle_port("example.com:12345"), "example.com:455");
        assert_eq!(mangle_port("[::1]:9080"), "[::1]:452");
    }

    #[test]
    fn malformed_input_is_unchanged() {
        assert_eq!(mangle_port("example.com"), "example.com");
        assert_eq!(mangle_port("example.com:http"), "example.com:http");
        assert_eq!(mangle_port("example.com:"), "example.com:");
        assert_eq!(mangle_port("::1"), "::1");
        assert_eq!(mangle_port("[::1]"), "[::1]");
        assert_eq!(mangle_port(""), "");
    }

    async fn send(method: Method, host: &str, path: &str) -> Response {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap();
        redirect_router().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn get_and_head_redirect_with_mangled_port() {
        for method in [Method::GET, Method::HEAD] {
            let res = send(method, "example.com:8081", "/a/b?c=d").await;
            assert_eq!(res.status(), StatusCode::FOUND);
            assert_eq!(
                res.headers()[header::LOCATION],
                "https://example.com:451/a/b?c=d"
            );
        }
    }

    #[tokio::test]
    async fn host_without_port_is_kept() {
        let res = send(Method::GET, "example.com", "/").await;
        assert_eq!(res.headers()[header::LOCATION], "https://example.com/");
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let res = send(method, "example.com", "/submit").await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
            assert!(res.headers().get(header::LOCATION).is_none());
        }
    }
}
