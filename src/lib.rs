//! Yasd Helper - HTTPS front for Surge's HTTP API
//!
//! Lets the Yasd dashboard reach a Surge instance that only speaks plain HTTP:
//! - Loads the certificate authority from the Surge profile's MITM section
//! - Issues a leaf certificate for the configured host name at startup
//! - Terminates TLS and forwards each request to the Surge instance named in
//!   its routing headers, filtering headers both ways

pub mod certificate;
pub mod config;
pub mod headers;
pub mod proxy;
pub mod upstream;

pub use certificate::{
    issue_cert_for_domain, CertificateAuthority, CertificateAuthorityError,
    CertificateIssuanceError, IssuedCertificate,
};
pub use config::{ConfigError, HelperConfig, StartupOptions};
pub use proxy::{
    proxy_service, ProxyBody, ProxyConfig, ProxyError, ProxyHandler, ProxyServer, ProxyTarget,
};
pub use upstream::{PooledUpstream, Upstream, UpstreamFailure};
