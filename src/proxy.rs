//! Proxy server implementation
//! Terminates TLS with the issued certificate and relays each request to the
//! Surge instance named in its routing headers

use crate::certificate::IssuedCertificate;
use crate::headers::{
    self, filter_headers, CORS_DEFAULT_HEADERS, CORS_EXTRA_HEADERS, IDENTITY_MARKER,
    POWERED_BY, REQUEST_HEADER_ALLOW_LIST, RESPONSE_HEADER_ALLOW_LIST, SURGE_HOST, SURGE_PORT,
};
use crate::upstream::{Upstream, UpstreamFailure};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::{Service, ServiceBuilder};
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::{CompressionBody, CompressionLayer};
use tower_http::cors::{AllowHeaders, Any, CorsLayer, ExposeHeaders};
use tracing::{debug, info, warn};

/// Responses smaller than this are sent uncompressed
const COMPRESSION_MIN_BYTES: u16 = 2048;

/// Body of every response leaving the service stack
pub type ProxyBody = CompressionBody<Full<Bytes>>;

/// Proxy server configuration
#[derive(Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub upstream_timeout: Duration,
    /// Value of the `x-powered-by` header on every non-error response
    pub powered_by: HeaderValue,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            upstream_timeout: Duration::from_secs(30),
            powered_by: HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing or invalid routing header {0}")]
    Routing(&'static str),

    #[error("upstream did not identify itself with x-surge-version")]
    UntrustedUpstream,

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("{source}")]
    Transport {
        status: StatusCode,
        #[source]
        source: UpstreamFailure,
    },

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Error body in the shape the dashboard expects
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    status_code: u16,
    error: &'a str,
    message: String,
}

/// Marks responses built by the structured error path, which are never decorated
#[derive(Debug, Clone, Copy)]
struct StructuredError;

impl ProxyError {
    /// Status code sent to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Routing(_) | ProxyError::UntrustedUpstream | ProxyError::RequestBody(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Transport { status, .. } => *status,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Tls(_) | ProxyError::Connection(_) | ProxyError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Rejections are answered with a bare status instead of an error body
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProxyError::Routing(_) | ProxyError::UntrustedUpstream)
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status();
        if self.is_rejection() {
            return status_response(status, Bytes::new());
        }

        let body = ErrorBody {
            status_code: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Unknown"),
            message: self.to_string(),
        };
        let json = serde_json::to_vec(&body).unwrap_or_default();

        let mut response = status_response(status, Bytes::from(json));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        response.extensions_mut().insert(StructuredError);
        response
    }
}

/// Upstream address carried by a request's routing headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ProxyError> {
        let host = header_str(headers, SURGE_HOST)
            .filter(|h| !h.is_empty())
            .ok_or(ProxyError::Routing(SURGE_HOST))?;
        let port = header_str(headers, SURGE_PORT)
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or(ProxyError::Routing(SURGE_PORT))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Plain HTTP URI on this target with the original path and query
    pub fn upstream_uri(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri, ProxyError> {
        let path = path_and_query.map(|pq| pq.as_str()).unwrap_or("/");
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        format!("http://{}:{}{}", host, self.port, path)
            .parse()
            .map_err(|_| ProxyError::Routing(SURGE_HOST))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Per-request pipeline, shared by every connection
pub struct ProxyHandler {
    upstream: Arc<dyn Upstream>,
    upstream_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(upstream: Arc<dyn Upstream>, config: &ProxyConfig) -> Self {
        Self {
            upstream,
            upstream_timeout: config.upstream_timeout,
        }
    }

    /// Handle one request. Failures are turned into responses here and never
    /// reach the connection.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match self.forward(req).await {
            Ok(response) => response,
            Err(e) if e.is_rejection() => {
                warn!("Rejected {} {}: {}", method, path, e);
                e.into_response()
            }
            Err(e) => {
                warn!("Failed {} {}: {}", method, path, e);
                e.into_response()
            }
        };

        info!(
            "{} {} -> {} ({} ms)",
            method,
            path,
            response.status().as_u16(),
            started.elapsed().as_millis()
        );

        response
    }

    async fn forward<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ProxyError>
    where
        B: Body,
        B::Error: Display,
    {
        // Resolve the target before touching the body or the upstream
        let target = ProxyTarget::from_headers(req.headers())?;
        let (parts, body) = req.into_parts();
        let uri = target.upstream_uri(parts.uri.path_and_query())?;

        debug!("Routing {} {} to {}", parts.method, parts.uri.path(), uri);

        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::RequestBody(e.to_string()))?
            .to_bytes();

        let mut upstream_req = Request::new(Full::new(body));
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = forwarded_headers(&parts.headers, &parts.uri);

        let upstream_res =
            match tokio::time::timeout(self.upstream_timeout, self.upstream.send(upstream_req))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(failure)) => {
                    let status = failure
                        .observed_status()
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    return Err(ProxyError::Transport {
                        status,
                        source: failure,
                    });
                }
                Err(_) => return Err(ProxyError::Timeout(self.upstream_timeout)),
            };

        if !upstream_res.headers().contains_key(IDENTITY_MARKER) {
            return Err(ProxyError::UntrustedUpstream);
        }

        let (parts, body) = upstream_res.into_parts();
        let mut response = status_response(parts.status, body);
        *response.headers_mut() = filter_headers(&parts.headers, &RESPONSE_HEADER_ALLOW_LIST);
        // The body is re-served as is, so its media type goes with it
        if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, content_type.clone());
        }

        Ok(response)
    }
}

/// Allow-listed request headers. HTTP/2 carries the host in the request
/// authority instead of a `host` header, so it is restored from there.
fn forwarded_headers(headers: &HeaderMap, uri: &Uri) -> HeaderMap {
    let mut forwarded = filter_headers(headers, &REQUEST_HEADER_ALLOW_LIST);
    if !forwarded.contains_key(HOST) {
        if let Some(value) = uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        {
            forwarded.insert(HOST, value);
        }
    }
    forwarded
}

fn decorate<B>(powered_by: &HeaderValue, mut response: Response<B>) -> Response<B> {
    if response.extensions().get::<StructuredError>().is_none() {
        response
            .headers_mut()
            .insert(POWERED_BY, powered_by.clone());
    }
    response
}

fn status_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

/// Permissive CORS for the dashboard, which runs on another origin
fn cors_layer() -> CorsLayer {
    let mut allowed = headers::header_names(&CORS_DEFAULT_HEADERS);
    allowed.extend(headers::header_names(&CORS_EXTRA_HEADERS));

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(AllowHeaders::list(allowed))
        .expose_headers(ExposeHeaders::list(headers::header_names(
            &RESPONSE_HEADER_ALLOW_LIST,
        )))
}

/// Service stack for one connection. Decoration sits outermost so CORS
/// preflights answered by the CORS layer carry it too.
pub fn proxy_service<B>(
    handler: Arc<ProxyHandler>,
    powered_by: HeaderValue,
) -> impl Service<
    Request<B>,
    Response = Response<ProxyBody>,
    Error = Infallible,
    Future = impl Future<Output = Result<Response<ProxyBody>, Infallible>> + Send,
> + Clone
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Display,
{
    ServiceBuilder::new()
        .map_response(move |response: Response<ProxyBody>| decorate(&powered_by, response))
        .layer(CompressionLayer::new().compress_when(SizeAbove::new(COMPRESSION_MIN_BYTES)))
        .layer(cors_layer())
        .service_fn(move |req: Request<B>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        })
}

/// Build the rustls acceptor presenting the issued certificate, offering h2
/// with HTTP/1.1 as fallback
pub fn tls_acceptor(issued: &IssuedCertificate) -> Result<TlsAcceptor, ProxyError> {
    let certs = rustls_pemfile::certs(&mut issued.certificate_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("invalid certificate PEM: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut issued.private_key_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("no private key in PEM".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    domain: String,
    tls_acceptor: TlsAcceptor,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new proxy server bound to `issued` and sending through `upstream`
    pub fn new(
        config: ProxyConfig,
        issued: &IssuedCertificate,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, ProxyError> {
        let tls_acceptor = tls_acceptor(issued)?;
        let handler = Arc::new(ProxyHandler::new(upstream, &config));

        Ok(Self {
            config,
            domain: issued.domain.clone(),
            tls_acceptor,
            handler,
        })
    }

    /// Serve until the process is terminated
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. Connections already accepted are
    /// left to finish on their own.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!("HTTPS server listening on {} for {}", addr, self.domain);

        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Proxy server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// TLS handshake, then HTTP/2 or HTTP/1.1 on the decrypted stream
    async fn handle_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<(), ProxyError> {
        let tls_stream = self
            .tls_acceptor
            .accept(stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", remote_addr, e)))?;

        let service =
            proxy_service::<Incoming>(self.handler.clone(), self.config.powered_by.clone());

        // Dropping the connection drops in-flight handlers and their upstream calls
        let builder = auto::Builder::new(TokioExecutor::new());
        let served = builder
            .serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(service))
            .await;

        served.map_err(|e| ProxyError::Connection(e.to_string()))
    }
}
