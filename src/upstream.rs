//! Outbound side of the proxy
//! The connection pool to Surge lives behind the [`Upstream`] trait so the
//! proxy can be handed any implementation at construction

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long an idle keep-alive connection stays in the pool
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A failed round trip to the upstream
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    /// Nothing usable came back: DNS, connect, or the request itself failed
    #[error("upstream request failed: {0}")]
    Request(#[source] BoxError),

    /// The status line arrived but the body could not be read
    #[error("upstream response body failed after status {status}: {source}")]
    Body {
        status: StatusCode,
        #[source]
        source: BoxError,
    },
}

impl UpstreamFailure {
    /// Status code the upstream reported before the failure, if any
    pub fn observed_status(&self) -> Option<StatusCode> {
        match self {
            UpstreamFailure::Request(_) => None,
            UpstreamFailure::Body { status, .. } => Some(*status),
        }
    }
}

/// Sends a fully buffered request upstream and buffers the response
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, UpstreamFailure>;
}

/// Keep-alive HTTP/1 client shared by every request
pub struct PooledUpstream {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl PooledUpstream {
    /// Pool keeping at most `max_idle_per_host` idle connections per upstream
    pub fn new(max_idle_per_host: usize) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(max_idle_per_host)
            .build(connector);

        Self { client }
    }
}

#[async_trait]
impl Upstream for PooledUpstream {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, UpstreamFailure> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| UpstreamFailure::Request(Box::new(e)))?;

        let (parts, body) = response.into_parts();
        debug!("Upstream answered {}", parts.status);

        let body = body
            .collect()
            .await
            .map_err(|e| UpstreamFailure::Body {
                status: parts.status,
                source: Box::new(e),
            })?
            .to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}
