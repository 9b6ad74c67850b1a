//! Upstream-authenticated proxy for an OpenAI-compatible inference service.
//!
//! Workloads talk to `http://gateway:port/v1/...` with a placeholder API key;
//! this proxy always replaces the `Authorization` header with the node-held
//! upstream key before forwarding. Responses stream chunk-by-chunk when the
//! request asked for `"stream": true`, so tokens reach the workload as the
//! upstream produces them.
//!
//! The committee aggregates responses across nodes and relies on bit-identical
//! outputs for bit-identical prompts. [`validate_determinism`] enforces that
//! at startup: every allowlisted model is queried with a fixed prompt and
//! seed, and the reply must match the embedded expectation byte-for-byte.

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::metrics::Metrics;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Socket-level budget for each read from the upstream.
const UPSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-exchange ceiling, sized for long streaming completions.
const UPSTREAM_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);
/// A streaming response that produces no chunk for this long is cut off.
/// Enforced per chunk while draining, independent of the total ceiling.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Fixed sampling parameters for the determinism gate.
pub const DETERMINISM_TEMPERATURE: f64 = 0.7;
pub const DETERMINISM_SEED: u64 = 4242;
pub const DETERMINISM_PROMPT: &str =
    "List the four Galilean moons of Jupiter in order of distance from the planet, as a single sentence.";

/// One allowlisted model and the exact completion it must produce for
/// [`DETERMINISM_PROMPT`] under the fixed temperature and seed.
pub struct ModelExpectation {
    pub model: &'static str,
    pub expected: &'static str,
}

/// Models this node is willing to proxy. A model absent here has no verified
/// expectation and must not be relied on by workloads.
pub const MODEL_ALLOWLIST: &[ModelExpectation] = &[
    ModelExpectation {
        model: "qwen2.5-7b-instruct",
        expected: "The four Galilean moons of Jupiter, in order of distance from the planet, are Io, Europa, Ganymede, and Callisto.",
    },
    ModelExpectation {
        model: "llama-3.1-8b-instruct",
        expected: "The four Galilean moons of Jupiter, in order of distance, are Io, Europa, Ganymede, and Callisto.",
    },
];

#[derive(Clone)]
pub struct InferenceProxyState {
    upstream: Url,
    api_key: String,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl InferenceProxyState {
    pub fn new(upstream: Url, api_key: String, metrics: Arc<Metrics>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(UPSTREAM_READ_TIMEOUT)
            .build()
            .expect("default reqwest client builds");
        Self {
            upstream,
            api_key,
            client,
            metrics,
        }
    }
}

pub fn routes(state: InferenceProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(models))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Binds and serves the proxy until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: InferenceProxyState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "inference proxy listening");
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn chat_completions(
    State(state): State<InferenceProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_upstream(state, Method::POST, "v1/chat/completions", headers, Some(body)).await
}

async fn completions(
    State(state): State<InferenceProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_upstream(state, Method::POST, "v1/completions", headers, Some(body)).await
}

async fn models(State(state): State<InferenceProxyState>, headers: HeaderMap) -> Response {
    proxy_upstream(state, Method::GET, "v1/models", headers, None).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn proxy_upstream(
    state: InferenceProxyState,
    method: Method,
    path: &str,
    headers: HeaderMap,
    body: Option<Bytes>,
) -> Response {
    state.metrics.inference_requests_total.inc();
    let url = match state.upstream.join(path) {
        Ok(url) => url,
        Err(error) => {
            tracing::error!(%error, path, "bad upstream path");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let stream_requested = body
        .as_deref()
        .map(detect_stream)
        .unwrap_or(false);

    let mut request = state
        .client
        .request(method, url)
        .timeout(UPSTREAM_TOTAL_TIMEOUT);
    for (name, value) in &headers {
        if !skip_request_header(name) {
            request = request.header(name, value);
        }
    }
    // The workload's placeholder credential never reaches the upstream.
    request = request.header(header::AUTHORIZATION, format!("Bearer {}", state.api_key));
    if let Some(body) = body {
        request = request.body(body);
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(%error, "inference upstream unreachable");
            return (StatusCode::BAD_GATEWAY, "inference upstream unreachable").into_response();
        }
    };

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !skip_response_header(name) {
            builder = builder.header(name, value);
        }
    }

    if stream_requested {
        // Flush chunks as the upstream produces them; no proxy-side buffering.
        builder = builder.header("X-Accel-Buffering", "no");
        let body = idle_bounded(upstream.bytes_stream(), STREAM_IDLE_TIMEOUT);
        builder
            .body(Body::from_stream(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    } else {
        match upstream.bytes().await {
            Ok(bytes) => builder
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
            Err(error) => {
                tracing::warn!(%error, "inference upstream body read failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

/// Headers owned by this hop rather than forwarded.
fn skip_request_header(name: &HeaderName) -> bool {
    name == header::HOST || name == header::CONTENT_LENGTH || name == header::AUTHORIZATION
}

fn skip_response_header(name: &HeaderName) -> bool {
    name == header::TRANSFER_ENCODING || name == header::CONTENT_LENGTH || name == header::CONNECTION
}

/// Reads `"stream": true` out of a JSON request body. Anything unparsable is
/// treated as non-streaming.
fn detect_stream(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

/// Applies a per-chunk deadline to a response stream. A gap longer than
/// `idle` between chunks yields an error, which terminates the proxied body
/// instead of holding the workload's connection open.
fn idle_bounded<S, E>(
    stream: S,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, Box<dyn std::error::Error + Send + Sync>>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    futures_util::stream::unfold(Box::pin(stream), move |mut stream| async move {
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => Some((item.map_err(Into::into), stream)),
            Ok(None) => None,
            Err(_) => {
                let cutoff = std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "inference stream idle past the cutoff",
                );
                Some((Err(cutoff.into()), stream))
            }
        }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DeterminismError {
    #[error("bad upstream url: {0}")]
    Url(#[from] url::ParseError),
    #[error("determinism probe for {model} failed: {source}")]
    Upstream {
        model: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("determinism probe for {model} returned no completion content")]
    Malformed { model: &'static str },
    #[error("model {model} is not deterministic: expected {expected:?}, got {actual:?}")]
    Mismatch {
        model: &'static str,
        expected: &'static str,
        actual: String,
    },
}

/// Startup gate: queries every allowlisted model with the fixed prompt and
/// requires byte-identical output. Any divergence or failure is fatal to the
/// caller — this node must not join a committee on a non-deterministic
/// upstream.
pub async fn validate_determinism(upstream: &Url, api_key: &str) -> Result<(), DeterminismError> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(UPSTREAM_READ_TIMEOUT)
        .timeout(UPSTREAM_TOTAL_TIMEOUT)
        .build()
        .expect("default reqwest client builds");
    let url = upstream.join("v1/chat/completions")?;

    for expectation in MODEL_ALLOWLIST {
        let body = json!({
            "model": expectation.model,
            "messages": [{ "role": "user", "content": DETERMINISM_PROMPT }],
            "temperature": DETERMINISM_TEMPERATURE,
            "seed": DETERMINISM_SEED,
            "stream": false,
        });
        let response = client
            .post(url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| DeterminismError::Upstream {
                model: expectation.model,
                source,
            })?;
        let value: serde_json::Value =
            response
                .json()
                .await
                .map_err(|source| DeterminismError::Upstream {
                    model: expectation.model,
                    source,
                })?;
        check_completion(expectation, &value)?;
        tracing::info!(model = expectation.model, "determinism check passed");
    }
    Ok(())
}

/// Compares one completion payload against its expectation, byte-for-byte.
fn check_completion(
    expectation: &ModelExpectation,
    value: &serde_json::Value,
) -> Result<(), DeterminismError> {
    let content = completion_content(value).ok_or(DeterminismError::Malformed {
        model: expectation.model,
    })?;
    if content.as_bytes() != expectation.expected.as_bytes() {
        return Err(DeterminismError::Mismatch {
            model: expectation.model,
            expected: expectation.expected,
            actual: content.to_string(),
        });
    }
    Ok(())
}

fn completion_content(value: &serde_json::Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_flag_is_detected() {
        assert!(detect_stream(br#"{"model":"m","stream":true}"#));
        assert!(!detect_stream(br#"{"model":"m","stream":false}"#));
        assert!(!detect_stream(br#"{"model":"m"}"#));
        assert!(!detect_stream(b"not json"));
        assert!(!detect_stream(br#"{"stream":"true"}"#));
    }

    #[test]
    fn completion_content_is_extracted() {
        let value = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
        });
        assert_eq!(completion_content(&value), Some("hello"));
        assert_eq!(completion_content(&json!({ "choices": [] })), None);
        assert_eq!(completion_content(&json!({})), None);
    }

    #[test]
    fn matching_completion_passes() {
        let expectation = &MODEL_ALLOWLIST[0];
        let value = json!({
            "choices": [{ "message": { "content": expectation.expected } }]
        });
        assert!(check_completion(expectation, &value).is_ok());
    }

    #[test]
    fn single_token_divergence_fails() {
        let expectation = &MODEL_ALLOWLIST[0];
        let diverged = expectation.expected.replace("Callisto", "Kallisto");
        let value = json!({
            "choices": [{ "message": { "content": diverged } }]
        });
        match check_completion(expectation, &value) {
            Err(DeterminismError::Mismatch { model, .. }) => {
                assert_eq!(model, expectation.model);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_content_is_malformed() {
        let expectation = &MODEL_ALLOWLIST[0];
        let value = json!({ "choices": [{ "message": {} }] });
        assert!(matches!(
            check_completion(expectation, &value),
            Err(DeterminismError::Malformed { .. })
        ));
    }

    #[test]
    fn auth_header_is_always_dropped_from_forwarded_set() {
        assert!(skip_request_header(&header::AUTHORIZATION));
        assert!(skip_request_header(&header::HOST));
        assert!(!skip_request_header(&header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn idle_bounded_passes_prompt_chunks_through() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"data: one\n")),
            Ok(Bytes::from_static(b"data: two\n")),
        ]);
        let collected: Vec<_> = idle_bounded(chunks, Duration::from_millis(200))
            .collect()
            .await;
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn idle_bounded_cuts_a_stalled_stream() {
        // One prompt chunk, then silence far past the idle cutoff.
        let stalled = futures_util::stream::unfold(0u8, |state| async move {
            match state {
                0 => Some((Ok::<_, std::io::Error>(Bytes::from_static(b"first")), 1)),
                _ => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    None
                }
            }
        });
        let mut stream = std::pin::pin!(idle_bounded(stalled, Duration::from_millis(50)));
        let first = stream.next().await.unwrap();
        assert!(first.is_ok());
        let second = stream.next().await.unwrap();
        assert!(second.is_err());
    }
}
