//! Integration tests for Yasd Helper
//!
//! Runs the helper over real sockets:
//! - TLS with a certificate issued from a PKCS#12 authority
//! - Routing by the x-surge-host / x-surge-port headers
//! - HTTP/1.1 and HTTP/2 clients
//! - Header filtering both ways
//! - Error mapping for rejected and failed upstream calls
//! - CORS preflight and response compression

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::TokioIo;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509NameBuilder, X509};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use yasd_helper::{
    issue_cert_for_domain, CertificateAuthority, PooledUpstream, ProxyConfig, ProxyServer,
};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// What the fake Surge answers
#[derive(Clone)]
struct BackendReply {
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: String,
    echo_body: bool,
    delay: Option<Duration>,
}

impl BackendReply {
    fn surge(status: u16) -> Self {
        Self {
            status,
            headers: vec![
                ("x-surge-version", "5"),
                ("x-surge-build", "2900"),
                ("x-system", "macOS 14.1"),
                ("content-type", "application/json"),
            ],
            body: "{\"ok\":true}".to_string(),
            echo_body: false,
            delay: None,
        }
    }
}

/// A request as the fake Surge saw it
struct Recorded {
    method: String,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
}

type RecordLog = Arc<Mutex<Vec<Recorded>>>;

/// Plain HTTP backend standing in for Surge's HTTP API
async fn run_backend_server(port: u16, reply: BackendReply) -> RecordLog {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let log: RecordLog = Arc::new(Mutex::new(Vec::new()));
    let server_log = log.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let reply = reply.clone();
            let log = server_log.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let reply = reply.clone();
                    let log = log.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.unwrap().to_bytes();
                        log.lock().unwrap().push(Recorded {
                            method: parts.method.to_string(),
                            uri: parts.uri.to_string(),
                            headers: parts.headers,
                            body: body.clone(),
                        });

                        if let Some(delay) = reply.delay {
                            sleep(delay).await;
                        }

                        let mut builder = Response::builder().status(reply.status);
                        for (name, value) in &reply.headers {
                            builder = builder.header(*name, *value);
                        }
                        let body = if reply.echo_body {
                            body
                        } else {
                            Bytes::from(reply.body.clone())
                        };

                        Ok::<_, Infallible>(builder.body(Full::new(body)).unwrap())
                    }
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    log
}

/// Self-signed CA like the one Surge generates for MITM
fn make_ca() -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "Surge Generated CA 1A2B3C")
        .unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (builder.build(), key)
}

struct TestProxy {
    port: u16,
    ca_pem: Vec<u8>,
}

/// Start a helper on a fresh port with a freshly minted authority
async fn setup_proxy(upstream_timeout: Duration) -> TestProxy {
    let (ca_cert, ca_key) = make_ca();
    let archive = Pkcs12::builder()
        .name("Surge Generated CA")
        .pkey(&ca_key)
        .cert(&ca_cert)
        .build2("p@ss")
        .unwrap();
    let archive = STANDARD.encode(archive.to_der().unwrap());

    let authority = CertificateAuthority::from_pkcs12_base64(&archive, "p@ss").unwrap();
    let issued = issue_cert_for_domain(&authority, "localhost").unwrap();

    let port = get_unique_port();
    let config = ProxyConfig {
        port,
        upstream_timeout,
        ..ProxyConfig::default()
    };
    let server = Arc::new(
        ProxyServer::new(config, &issued, Arc::new(PooledUpstream::new(4))).unwrap(),
    );
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(200)).await;

    TestProxy {
        port,
        ca_pem: ca_cert.to_pem().unwrap(),
    }
}

/// Client builder trusting only the test authority
fn client_builder(proxy: &TestProxy) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(&proxy.ca_pem).unwrap())
        .resolve("localhost", SocketAddr::from(([127, 0, 0, 1], proxy.port)))
}

fn client(proxy: &TestProxy) -> reqwest::Client {
    client_builder(proxy).build().unwrap()
}

fn url(proxy: &TestProxy, path: &str) -> String {
    format!("https://localhost:{}{}", proxy.port, path)
}

/// Send one routed GET with `client` and check what Surge received
async fn check_forwarding(
    configure: fn(reqwest::ClientBuilder) -> reqwest::ClientBuilder,
    version: reqwest::Version,
) {
    let backend_port = get_unique_port();
    let log = run_backend_server(backend_port, BackendReply::surge(200)).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;
    let client = configure(client_builder(&proxy)).build().unwrap();

    let response = client
        .get(url(&proxy, "/v1/test?fields=all"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .header("x-key", "examplekey")
        .header("user-agent", "yasd-test")
        .header("authorization", "Bearer nope")
        .header("x-extra", "drop me")
        .send()
        .await
        .unwrap();

    assert_eq!(response.version(), version);
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.text().await.unwrap(), "{\"ok\":true}");

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    let seen = &log[0];
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.uri, "/v1/test?fields=all");
    assert_eq!(seen.headers["x-key"], "examplekey");
    assert_eq!(seen.headers["user-agent"], "yasd-test");
    assert_eq!(
        seen.headers["host"],
        format!("localhost:{}", proxy.port).as_str()
    );
    for dropped in ["x-surge-host", "x-surge-port", "authorization", "x-extra", "accept"] {
        assert!(!seen.headers.contains_key(dropped), "{} was forwarded", dropped);
    }
}

#[tokio::test]
async fn test_proxy_forwards_to_surge_over_http1() {
    check_forwarding(|builder| builder.http1_only(), reqwest::Version::HTTP_11).await;
}

#[tokio::test]
async fn test_proxy_forwards_to_surge_over_http2() {
    check_forwarding(
        |builder| builder.http2_prior_knowledge(),
        reqwest::Version::HTTP_2,
    )
    .await;
}

#[tokio::test]
async fn test_not_found_keeps_status_and_allowed_headers() {
    let backend_port = get_unique_port();
    let mut reply = BackendReply::surge(404);
    reply.headers = vec![
        ("x-surge-version", "5"),
        ("x-surge-build", "123"),
        ("x-other", "internal"),
        ("set-cookie", "session=1"),
    ];
    run_backend_server(backend_port, reply).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;

    let response = client(&proxy)
        .get(url(&proxy, "/v1/missing"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    let headers = response.headers();
    assert_eq!(headers["x-surge-build"], "123");
    assert_eq!(headers["x-surge-version"], "5");
    assert!(headers["x-powered-by"]
        .to_str()
        .unwrap()
        .starts_with("yasd-helper/"));
    assert!(!headers.contains_key("x-other"));
    assert!(!headers.contains_key("set-cookie"));
}

#[tokio::test]
async fn test_missing_routing_headers_rejected() {
    let backend_port = get_unique_port();
    let log = run_backend_server(backend_port, BackendReply::surge(200)).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;
    let client = client(&proxy);

    let no_headers = client.get(url(&proxy, "/v1/test")).send().await.unwrap();
    assert_eq!(no_headers.status().as_u16(), 400);

    let host_only = client
        .get(url(&proxy, "/v1/test"))
        .header("x-surge-host", "127.0.0.1")
        .send()
        .await
        .unwrap();
    assert_eq!(host_only.status().as_u16(), 400);

    let port_only = client
        .get(url(&proxy, "/v1/test"))
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(port_only.status().as_u16(), 400);
    assert!(port_only.headers().contains_key("x-powered-by"));

    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_untrusted_upstream_rejected() {
    let backend_port = get_unique_port();
    let reply = BackendReply {
        status: 200,
        headers: vec![("x-surge-build", "123")],
        body: "not surge".to_string(),
        echo_body: false,
        delay: None,
    };
    let log = run_backend_server(backend_port, reply).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;

    let response = client(&proxy)
        .get(url(&proxy, "/v1/test"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(response.status().as_u16(), 400);
    assert!(!response.headers().contains_key("x-surge-build"));
    assert_eq!(response.text().await.unwrap(), "");
}

#[tokio::test]
async fn test_unreachable_upstream_is_500() {
    // Nothing listens on this port
    let backend_port = get_unique_port();
    let proxy = setup_proxy(Duration::from_secs(5)).await;

    let response = client(&proxy)
        .get(url(&proxy, "/v1/test"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 500);
    assert!(!response.headers().contains_key("x-powered-by"));

    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["statusCode"], 500);
    assert_eq!(body["error"], "Internal Server Error");
}

#[tokio::test]
async fn test_request_body_passthrough() {
    let backend_port = get_unique_port();
    let mut reply = BackendReply::surge(200);
    reply.echo_body = true;
    let log = run_backend_server(backend_port, reply).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;

    let payload = "{\"mode\":\"rule\"}";
    let response = client(&proxy)
        .post(url(&proxy, "/v1/outbound"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .body(payload)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), payload);

    let log = log.lock().unwrap();
    assert_eq!(log[0].method, "POST");
    assert_eq!(log[0].body, Bytes::from_static(payload.as_bytes()));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let backend_port = get_unique_port();
    let mut reply = BackendReply::surge(200);
    reply.delay = Some(Duration::from_secs(3));
    run_backend_server(backend_port, reply).await;
    let proxy = setup_proxy(Duration::from_millis(300)).await;

    let response = client(&proxy)
        .get(url(&proxy, "/v1/traffic"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 504);
}

#[tokio::test]
async fn test_cors_preflight_answered_locally() {
    let backend_port = get_unique_port();
    let log = run_backend_server(backend_port, BackendReply::surge(200)).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;

    let response = client(&proxy)
        .request(reqwest::Method::OPTIONS, url(&proxy, "/v1/test"))
        .header("origin", "https://yasd.example.com")
        .header("access-control-request-method", "GET")
        .header(
            "access-control-request-headers",
            "x-key,x-surge-host,x-surge-port",
        )
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    let allowed = headers["access-control-allow-headers"].to_str().unwrap();
    for name in ["x-key", "x-surge-host", "x-surge-port"] {
        assert!(allowed.contains(name), "{} not allowed", name);
    }
    assert!(headers["x-powered-by"]
        .to_str()
        .unwrap()
        .starts_with("yasd-helper/"));

    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cors_headers_on_proxied_response() {
    let backend_port = get_unique_port();
    run_backend_server(backend_port, BackendReply::surge(200)).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;

    let response = client(&proxy)
        .get(url(&proxy, "/v1/test"))
        .header("origin", "https://yasd.example.com")
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert!(headers["access-control-expose-headers"]
        .to_str()
        .unwrap()
        .contains("x-surge-version"));
}

#[tokio::test]
async fn test_large_response_gzipped() {
    let backend_port = get_unique_port();
    let mut reply = BackendReply::surge(200);
    let entries = vec!["{\"id\":1,\"url\":\"https://example.com/\"}"; 80].join(",");
    reply.body = format!("{{\"requests\":[{}]}}", entries);
    run_backend_server(backend_port, reply.clone()).await;
    let proxy = setup_proxy(Duration::from_secs(5)).await;
    let client = client(&proxy);

    let gzipped = client
        .get(url(&proxy, "/v1/requests/recent"))
        .header("accept-encoding", "gzip")
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(gzipped.status().as_u16(), 200);
    assert_eq!(gzipped.headers()["content-encoding"], "gzip");
    let body = gzipped.bytes().await.unwrap();
    assert_eq!(&body[..2], &[0x1f, 0x8b]);
    assert!(body.len() < reply.body.len());

    let plain = client
        .get(url(&proxy, "/v1/requests/recent"))
        .header("x-surge-host", "127.0.0.1")
        .header("x-surge-port", backend_port.to_string())
        .send()
        .await
        .unwrap();

    assert!(!plain.headers().contains_key("content-encoding"));
    assert_eq!(plain.text().await.unwrap(), reply.body);
}
