//! Pooled HTTP client for the wrapped server's internal listen port
//!
//! A single fixed upstream, reached through a pooled hyper client so
//! keep-alive connections are reused across proxied requests.

use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Maximum idle connections kept open to the upstream
const MAX_IDLE_CONNECTIONS: usize = 10;
/// Idle connection timeout
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Error type for upstream requests
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error re-targeting the request at the upstream
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "client error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "request build error: {}", s),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// A pooled HTTP client pinned to the wrapped server's port.
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
    port: u16,
}

impl UpstreamClient {
    pub fn new(port: u16) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(connector);

        debug!(port, "upstream client initialized");

        Self { client, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Re-target a request at the upstream and send it through the pool.
    /// Headers pass through untouched, including the inbound `Host`.
    pub async fn send(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://127.0.0.1:{}{}", self.port, path_and_query)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| {
                UpstreamError::RequestBuild(e.to_string())
            })?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;

        Ok(self.client.request(Request::from_parts(parts, body)).await?)
    }
}
