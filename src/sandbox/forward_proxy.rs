//! Host-side egress proxy for sandboxed workloads.
//!
//! Bound on `gateway:forwardPort`, this is the only externally reachable
//! path out of the sandbox. Plain HTTP uses absolute-URI proxy semantics;
//! HTTPS uses CONNECT tunneling with no certificate interception — bytes are
//! copied both ways until either side closes, a write stalls past its
//! deadline, or the tunnel goes idle past the cutoff.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Per-request upstream budget for plain-HTTP forwarding.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for reading a request head from a sandboxed client.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// A CONNECT tunnel with no traffic in either direction for this long is
/// torn down.
const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for flushing one tunnel chunk to a slow peer.
const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const TUNNEL_BUF_SIZE: usize = 8 * 1024;

/// Optional request gate. Return `false` to refuse with 407.
pub type AuthorizeFn = Arc<dyn Fn(&Method, &Uri, &HeaderMap) -> bool + Send + Sync>;

struct ProxyState {
    metrics: Arc<Metrics>,
    authorize: Option<AuthorizeFn>,
}

pub struct ForwardProxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl ForwardProxy {
    /// Binds the proxy listener on the sandbox gateway.
    pub async fn bind(
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        authorize: Option<AuthorizeFn>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "forward proxy listening");
        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ProxyState { metrics, authorize }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Each connection is served with upgrade support so CONNECT
    /// tunnels survive past the HTTP exchange.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!(%error, "proxy accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            let state = Arc::clone(&self.state);
            let conn_cancel = cancel.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |req| handle(req, Arc::clone(&state), peer));
                let conn = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(HEADER_READ_TIMEOUT)
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(io, service)
                    .with_upgrades();
                tokio::pin!(conn);
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(error) = result {
                            tracing::debug!(%peer, %error, "proxy connection ended");
                        }
                    }
                    _ = conn_cancel.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        let _ = conn.await;
                    }
                }
            });
        }
        tracing::info!("forward proxy stopped");
    }
}

async fn handle<B>(
    req: Request<B>,
    state: Arc<ProxyState>,
    peer: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    state.metrics.proxy_requests_total.inc();
    state.metrics.proxy_requests_in_flight.inc();
    let result = serve(req, &state, peer).await;
    state.metrics.proxy_requests_in_flight.dec();
    result
}

async fn serve<B>(
    req: Request<B>,
    state: &ProxyState,
    peer: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if let Some(authorize) = &state.authorize {
        if !authorize(req.method(), req.uri(), req.headers()) {
            tracing::debug!(%peer, uri = %req.uri(), "proxy request refused");
            return Ok(status_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "proxy authorization refused",
            ));
        }
    }

    if req.method() == Method::CONNECT {
        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "CONNECT requires an authority",
            ));
        };
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(error) = tunnel(upgraded, &authority).await {
                        tracing::debug!(%peer, authority, %error, "tunnel closed");
                    }
                }
                Err(error) => {
                    tracing::warn!(%peer, %error, "CONNECT upgrade failed");
                }
            }
        });
        return Ok(Response::new(empty_body()));
    }

    // Plain HTTP requires proxy-form (absolute-URI) requests.
    let Some(host) = req.uri().host().map(|h| h.to_string()) else {
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use an absolute URI",
        ));
    };
    let port = req.uri().port_u16().unwrap_or(80);

    let forwarded = tokio::time::timeout(UPSTREAM_TIMEOUT, forward(req, &host, port)).await;
    match forwarded {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => {
            tracing::debug!(%peer, host, %error, "upstream request failed");
            Ok(status_response(StatusCode::BAD_GATEWAY, "upstream failed"))
        }
        Err(_) => Ok(status_response(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream timed out",
        )),
    }
}

async fn forward<B>(
    req: Request<B>,
    host: &str,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Box<dyn std::error::Error + Send + Sync>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = TcpStream::connect((host, port)).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            tracing::debug!(%error, "upstream connection ended");
        }
    });
    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}

async fn tunnel(upgraded: Upgraded, authority: &str) -> std::io::Result<(u64, u64)> {
    let mut server = TcpStream::connect(authority).await?;
    let mut client = TokioIo::new(upgraded);
    pump(
        &mut client,
        &mut server,
        TUNNEL_IDLE_TIMEOUT,
        TUNNEL_WRITE_TIMEOUT,
    )
    .await
}

enum Pumped {
    FromClient(usize),
    FromServer(usize),
}

/// Copies bytes both ways until either side closes, enforcing an idle cutoff
/// across both directions and a per-chunk write deadline. A stalled peer
/// cannot hold the tunnel task and its sockets open indefinitely.
async fn pump<C, S>(
    client: &mut C,
    server: &mut S,
    idle: Duration,
    write_deadline: Duration,
) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; TUNNEL_BUF_SIZE];
    let mut server_buf = vec![0u8; TUNNEL_BUF_SIZE];
    let mut to_server = 0u64;
    let mut to_client = 0u64;

    loop {
        let pumped = tokio::time::timeout(idle, async {
            tokio::select! {
                read = client.read(&mut client_buf) => read.map(Pumped::FromClient),
                read = server.read(&mut server_buf) => read.map(Pumped::FromServer),
            }
        })
        .await;

        match pumped {
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "tunnel idle past the cutoff",
                ));
            }
            Ok(Err(error)) => return Err(error),
            Ok(Ok(Pumped::FromClient(0))) | Ok(Ok(Pumped::FromServer(0))) => break,
            Ok(Ok(Pumped::FromClient(n))) => {
                write_with_deadline(server, &client_buf[..n], write_deadline).await?;
                to_server += n as u64;
            }
            Ok(Ok(Pumped::FromServer(n))) => {
                write_with_deadline(client, &server_buf[..n], write_deadline).await?;
                to_client += n as u64;
            }
        }
    }

    let _ = server.shutdown().await;
    let _ = client.shutdown().await;
    Ok((to_server, to_client))
}

async fn write_with_deadline<W>(
    writer: &mut W,
    buf: &[u8],
    deadline: Duration,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, writer.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "tunnel write stalled",
        )),
    }
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, message: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn state(authorize: Option<AuthorizeFn>) -> Arc<ProxyState> {
        Arc::new(ProxyState {
            metrics: Metrics::new(),
            authorize,
        })
    }

    fn peer() -> SocketAddr {
        "172.28.0.2:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn relative_uri_is_refused() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/not-absolute")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle(req, state(None), peer()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn connect_without_authority_is_refused() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle(req, state(None), peer()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn authorization_hook_can_refuse() {
        let deny: AuthorizeFn = Arc::new(|_, _, _| false);
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://example.test/resource")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle(req, state(Some(deny)), peer()).await.unwrap();
        assert_eq!(
            response.status(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
    }

    #[tokio::test]
    async fn request_metrics_are_counted() {
        let state = state(None);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/relative")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let _ = handle(req, Arc::clone(&state), peer()).await.unwrap();
        assert_eq!(state.metrics.proxy_requests_total.get(), 1);
        assert_eq!(state.metrics.proxy_requests_in_flight.get(), 0);
    }

    #[tokio::test]
    async fn pump_forwards_both_directions_until_eof() {
        let (mut workload_side, mut proxy_client) = tokio::io::duplex(64);
        let (mut upstream_side, mut proxy_server) = tokio::io::duplex(64);
        let pump_task = tokio::spawn(async move {
            pump(
                &mut proxy_client,
                &mut proxy_server,
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await
        });

        workload_side.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_side.write_all(b"world").await.unwrap();
        workload_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(workload_side);
        let (to_server, to_client) = pump_task.await.unwrap().unwrap();
        assert_eq!(to_server, 5);
        assert_eq!(to_client, 5);
    }

    #[tokio::test]
    async fn pump_tears_down_an_idle_tunnel() {
        // Both far ends stay open but silent; the idle cutoff must fire.
        let (_workload_side, mut proxy_client) = tokio::io::duplex(64);
        let (_upstream_side, mut proxy_server) = tokio::io::duplex(64);
        let error = pump(
            &mut proxy_client,
            &mut proxy_server,
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
    }
}
