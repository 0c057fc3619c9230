//! HTTP gateway fronting the wrapped server
//!
//! Every request is forwarded to the wrapped server's internal port with
//! the pre-auth header injected. One control endpoint is answered locally,
//! and HTML responses served under an ingress path prefix get their base
//! href rewritten on the way out.

use crate::config::Options;
use crate::rewrite;
use crate::upstream::UpstreamClient;
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Port the gateway serves all client traffic on
pub const GATEWAY_PORT: u16 = 8080;

/// The one path answered locally instead of being proxied
const AUTH_REFRESH_PATH: &str = "/api/v1/auth/refresh";
/// Fixed body signalling that no token refresh is available
const AUTH_REFRESH_BODY: &str = r#"{"AccessToken":null}"#;

/// Header carrying the ingress path prefix
const X_INGRESS_PATH: &str = "x-ingress-path";
/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Bound on waiting for in-flight requests at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The gateway server.
pub struct Gateway {
    bind_addr: SocketAddr,
    options: Arc<Options>,
    upstream: Arc<UpstreamClient>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        bind_addr: SocketAddr,
        options: Arc<Options>,
        upstream_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            options,
            upstream: Arc::new(UpstreamClient::new(upstream_port)),
            shutdown_rx,
        }
    }

    /// Serve until the shutdown flag flips, then stop accepting and let
    /// in-flight requests finish.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("cannot listen to {}", self.bind_addr))?;
        info!(addr = %self.bind_addr, "gateway listening...");

        let builder = AutoBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let io = TokioIo::new(stream);
                            let options = Arc::clone(&self.options);
                            let upstream = Arc::clone(&self.upstream);

                            let service = service_fn(move |req: Request<Incoming>| {
                                let options = Arc::clone(&options);
                                let upstream = Arc::clone(&upstream);
                                async move { handle_request(req, options, upstream, addr).await }
                            });

                            let conn = builder.serve_connection_with_upgrades(io, service);
                            let conn = graceful.watch(conn.into_owned());
                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("gateway shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => {}
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("in-flight requests did not finish in time, closing anyway");
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    options: Arc<Options>,
    upstream: Arc<UpstreamClient>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = route(req, options, upstream, client_addr).await?;

    debug!(
        method = %method,
        uri = %uri,
        remote = %client_addr,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    Ok(response)
}

async fn route(
    req: Request<Incoming>,
    options: Arc<Options>,
    upstream: Arc<UpstreamClient>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if req.uri().path() == AUTH_REFRESH_PATH {
        return Ok(handle_auth_refresh(&req));
    }
    if is_upgrade_request(&req) {
        return handle_upgrade(req, &options, upstream.port()).await;
    }
    forward(req, options, upstream, client_addr).await
}

/// The wrapped server's token-refresh endpoint must not reach it through
/// the pre-auth header; answer locally that no refresh is available.
fn handle_auth_refresh<B>(req: &Request<B>) -> Response<ProxyBody> {
    if req.method() == Method::GET || req.method() == Method::POST {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full(AUTH_REFRESH_BODY))
            .expect("valid response builder")
    } else {
        text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
    }
}

async fn forward(
    mut req: Request<Incoming>,
    options: Arc<Options>,
    upstream: Arc<UpstreamClient>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Interception conditions are captured before the request moves on
    let is_get = req.method() == Method::GET;
    let ingress_path = req
        .headers()
        .get(X_INGRESS_PATH)
        .and_then(|v| v.to_str().ok())
        .map(|v| rewrite::normalize_ingress_path(v).to_string())
        .unwrap_or_default();

    rewrite_request_headers(&mut req, &options, client_addr);

    let response = match upstream.send(req).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "cannot forward request to upstream");
            return Ok(internal_error());
        }
    };

    if is_get && !ingress_path.is_empty() && is_html(&response) {
        return intercept_html(response, &ingress_path).await;
    }

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Forwarded headers are overwritten rather than appended: this gateway is
/// the first trusted hop. The inbound `Host` is preserved, and the
/// pre-auth secret replaces whatever credential the client carried.
fn rewrite_request_headers(
    req: &mut Request<Incoming>,
    options: &Options,
    client_addr: SocketAddr,
) {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let auth = format!("PreAuth {}", options.secrets.webservice_pre_auth_tokens);
    if let Ok(value) = HeaderValue::from_str(&auth) {
        headers.insert(header::AUTHORIZATION, value);
    }
}

fn is_html<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false)
}

/// Buffer a matching HTML response and splice in the ingress prefix,
/// recomputing the Content-Length to match the rewritten body.
async fn intercept_html(
    response: Response<Incoming>,
    ingress_path: &str,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let (mut parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "cannot buffer HTML body");
            return Ok(internal_error());
        }
    };

    let body = match rewrite::inject_prefix(&bytes, ingress_path) {
        Some(rewritten) => Bytes::from(rewritten),
        None => bytes,
    };

    parts.headers.remove(header::TRANSFER_ENCODING);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

    Ok(Response::from_parts(parts, full(body)))
}

/// Check if a request asks for a protocol upgrade (e.g. websockets)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP upgrade request to relay to the upstream, swapping
/// any client credential for the pre-auth header.
fn build_upgrade_request<B>(req: &Request<B>, pre_auth_token: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == header::AUTHORIZATION {
            continue;
        }
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    raw.push_str(&format!("Authorization: PreAuth {}\r\n", pre_auth_token));
    raw.push_str("\r\n");

    raw.into_bytes()
}

/// Parse the upstream's answer to an upgrade request
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Relay a protocol upgrade. The upstream must answer 101; anything else
/// is passed back to the client, and a client connection that cannot
/// switch protocols fails explicitly rather than silently downgrading.
async fn handle_upgrade(
    req: Request<Incoming>,
    options: &Options,
    port: u16,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let raw_request =
        build_upgrade_request(&req, &options.secrets.webservice_pre_auth_tokens);

    let upstream_addr = format!("127.0.0.1:{}", port);
    let mut upstream_stream = match TcpStream::connect(&upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot connect to upstream for upgrade");
            return Ok(internal_error());
        }
    };

    if let Err(e) = upstream_stream.write_all(&raw_request).await {
        error!(error = %e, "cannot send upgrade request to upstream");
        return Ok(internal_error());
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match upstream_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!("upstream closed connection before answering upgrade");
            return Ok(internal_error());
        }
        Err(e) => {
            error!(error = %e, "cannot read upgrade response from upstream");
            return Ok(internal_error());
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        error!("cannot parse upstream upgrade response");
        return Ok(internal_error());
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %status, "upstream rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_stream).await
                {
                    Ok((to_upstream, to_client)) => {
                        debug!(to_upstream, to_client, "upgraded connection closed");
                    }
                    Err(e) => {
                        debug!(error = %e, "upgraded connection closed with error");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "cannot upgrade client connection");
            }
        }
    });

    Ok(response)
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(message.to_string()))
        .expect("valid response builder")
}

fn internal_error() -> Response<ProxyBody> {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}
