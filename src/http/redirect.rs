//! HTTPS enforcement.
//!
//! A plain-HTTP app whose main job is a `301 Moved Permanently` to the same
//! path and query on the HTTPS listener. The host comes from the request's
//! `Host` header (or URI authority) with its port replaced.
//!
//! With a certificate manager attached, HTTP-01 challenge paths are answered
//! here instead of being redirected.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::net::acme::CertManager;

/// App redirecting every request to port `tls_port`, except ACME challenges
/// when `acme` is set.
pub fn redirect_app(tls_port: u16, acme: Option<Arc<CertManager>>) -> Router {
    let app = Router::new().fallback(redirect_to_https).with_state(tls_port);
    match acme {
        Some(manager) => Router::new()
            .route("/.well-known/acme-challenge/{token}", get(answer_challenge))
            .with_state(manager)
            .merge(app),
        None => app,
    }
}

async fn answer_challenge(State(manager): State<Arc<CertManager>>, Path(token): Path<String>) -> Response {
    match manager.challenge_response(&token) {
        Some(key_authorization) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            key_authorization,
        )
            .into_response(),
        None => {
            tracing::debug!(token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn redirect_to_https(State(tls_port): State<u16>, request: Request) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()));
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let Some(location) = host.and_then(|host| https_location(host, tls_port, path_and_query)) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, value)]).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "Invalid Host header").into_response(),
    }
}

/// `https://` URL for `host` (port stripped) on `tls_port`.
pub fn https_location(host: &str, tls_port: u16, path_and_query: &str) -> Option<String> {
    let host = strip_port(host);
    if host.is_empty() {
        return None;
    }
    Some(if tls_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, tls_port, path_and_query)
    })
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    #[test]
    fn location_replaces_port() {
        assert_eq!(
            https_location("example.com:80", 8443, "/a?b=c").as_deref(),
            Some("https://example.com:8443/a?b=c")
        );
        assert_eq!(
            https_location("example.com", 443, "/").as_deref(),
            Some("https://example.com/")
        );
        assert_eq!(
            https_location("[::1]:8080", 8443, "/x").as_deref(),
            Some("https://[::1]:8443/x")
        );
        assert_eq!(https_location(":80", 443, "/"), None);
    }

    #[tokio::test]
    async fn answers_with_permanent_redirect() {
        let response = redirect_app(8443, None)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/login?next=%2Fhome")
                    .header("Host", "example.com:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com:8443/login?next=%2Fhome"
        );
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let response = redirect_app(443, None)
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn acme_app() -> (Router, Arc<CertManager>) {
        let root = std::env::temp_dir().join(format!("airway-redirect-{}", uuid::Uuid::new_v4()));
        let config = crate::config::AcmeConfig {
            enabled: true,
            cert_root: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let manager = CertManager::new(&config).unwrap();
        (redirect_app(443, Some(Arc::clone(&manager))), manager)
    }

    fn get_from(path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(path)
            .header("Host", "example.com")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn challenge_path_is_answered_not_redirected() {
        let (app, manager) = acme_app();
        manager.insert_challenge("tok3n", "tok3n.thumbprint");

        let response = app
            .clone()
            .oneshot(get_from("/.well-known/acme-challenge/tok3n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"tok3n.thumbprint");

        let unknown = app
            .clone()
            .oneshot(get_from("/.well-known/acme-challenge/other"))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let page = app.oneshot(get_from("/account")).await.unwrap();
        assert_eq!(page.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(page.headers()[header::LOCATION], "https://example.com/account");
    }

    #[tokio::test]
    async fn challenge_path_redirects_without_acme() {
        let response = redirect_app(443, None)
            .oneshot(get_from("/.well-known/acme-challenge/tok3n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }
}
