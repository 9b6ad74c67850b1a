//! Control-plane HTTP endpoints.
//!
//! `GET /health`, `GET /version`, and `GET /metrics`. When an API key is
//! configured, health and version require a bearer token; `/metrics` is
//! intentionally left open so scrapers need no credentials. Everything else
//! is 404.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::TextEncoder;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
const BUILD_TIME: &str = match option_env!("BUILD_TIME") {
    Some(time) => time,
    None => "unknown",
};

#[derive(Clone)]
pub struct ControlState {
    api_key: Option<String>,
    metrics: Arc<Metrics>,
}

impl ControlState {
    pub fn new(api_key: Option<String>, metrics: Arc<Metrics>) -> Self {
        Self { api_key, metrics }
    }
}

pub fn routes(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics_text))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the control plane until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ControlState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control plane listening");
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health(State(state): State<ControlState>, headers: HeaderMap) -> Response {
    if !authorized(state.api_key.as_deref(), &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "status": "healthy", "version": VERSION })).into_response()
}

async fn version(State(state): State<ControlState>, headers: HeaderMap) -> Response {
    if !authorized(state.api_key.as_deref(), &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "version": VERSION,
        "gitCommit": GIT_COMMIT,
        "buildTime": BUILD_TIME,
    }))
    .into_response()
}

/// Prometheus exposition. Unauthenticated by design: scrape configs stay
/// credential-free.
async fn metrics_text(State(state): State<ControlState>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.metrics.registry().gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn authorized(api_key: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = api_key else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn open_when_no_key_configured() {
        assert!(authorized(None, &HeaderMap::new()));
        assert!(authorized(None, &headers_with_bearer("anything")));
    }

    #[test]
    fn key_requires_matching_bearer() {
        assert!(authorized(Some("secret"), &headers_with_bearer("secret")));
        assert!(!authorized(Some("secret"), &headers_with_bearer("wrong")));
        assert!(!authorized(Some("secret"), &HeaderMap::new()));
    }

    #[test]
    fn non_bearer_scheme_is_refused() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic c2VjcmV0"),
        );
        assert!(!authorized(Some("secret"), &headers));
    }

    #[tokio::test]
    async fn health_refuses_without_token_when_keyed() {
        let state = ControlState::new(Some("secret".to_string()), Metrics::new());
        let response = health(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_reports_version() {
        let state = ControlState::new(None, Metrics::new());
        let response = health(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_ignores_auth() {
        let state = ControlState::new(Some("secret".to_string()), Metrics::new());
        state.metrics.heartbeats_sent.inc();
        let response = metrics_text(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
