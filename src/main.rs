//! Yasd Helper - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use yasd_helper::config::{
    DEFAULT_HOST, DEFAULT_POOL_MAX_IDLE, DEFAULT_PORT, DEFAULT_UPSTREAM_TIMEOUT_SECS,
};
use yasd_helper::headers::powered_by;
use yasd_helper::{
    issue_cert_for_domain, CertificateAuthority, HelperConfig, PooledUpstream, ProxyConfig,
    ProxyServer, StartupOptions,
};

/// Yasd Helper - serve Surge's HTTP API over HTTPS for the Yasd dashboard
#[derive(Parser, Debug)]
#[command(name = "yasd-helper")]
#[command(author = "Yasd Helper Contributors")]
#[command(version)]
#[command(about = "Serve Surge's HTTP API over HTTPS for the Yasd dashboard")]
struct Args {
    /// Surge profile to read the MITM certificate from
    #[arg(short = 's', long = "surge", env = "SURGE_CONFIG")]
    surge: Option<PathBuf>,

    /// Base64 PKCS#12 CA archive, overrides the profile
    #[arg(long, env = "YASD_CA_P12", hide_env_values = true)]
    ca_p12: Option<String>,

    /// Passphrase of the CA archive, overrides the profile
    #[arg(long, env = "YASD_CA_PASSPHRASE", hide_env_values = true)]
    ca_passphrase: Option<String>,

    /// Domain name the certificate is issued for
    #[arg(long, env = "YASD_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// HTTPS port to listen on
    #[arg(short = 'p', long, env = "YASD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait for Surge before answering 504
    #[arg(long, env = "YASD_UPSTREAM_TIMEOUT", default_value_t = DEFAULT_UPSTREAM_TIMEOUT_SECS)]
    upstream_timeout: u64,

    /// Idle keep-alive connections kept per Surge instance
    #[arg(long, env = "YASD_POOL_MAX_IDLE", default_value_t = DEFAULT_POOL_MAX_IDLE)]
    pool_max_idle: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print debug logs
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!("Starting Yasd Helper v{}", env!("CARGO_PKG_VERSION"));

    let config = HelperConfig::from_options(StartupOptions {
        surge_profile: args.surge,
        ca_p12: args.ca_p12,
        ca_passphrase: args.ca_passphrase,
        host: args.host,
        port: args.port,
        upstream_timeout_secs: args.upstream_timeout,
        pool_max_idle: args.pool_max_idle,
    })
    .context("Invalid configuration")?;

    let authority = CertificateAuthority::from_pkcs12_base64(&config.ca_p12, &config.ca_passphrase)
        .context("Failed to load the certificate authority")?;

    let issued = issue_cert_for_domain(&authority, &config.host)
        .with_context(|| format!("Failed to issue a certificate for {}", config.host))?;

    let proxy_config = ProxyConfig {
        port: config.port,
        upstream_timeout: config.upstream_timeout,
        powered_by: powered_by(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
            .context("Invalid release name")?,
    };
    let upstream = Arc::new(PooledUpstream::new(config.pool_max_idle));
    let server = Arc::new(
        ProxyServer::new(proxy_config, &issued, upstream).context("Failed to set up TLS")?,
    );

    info!("Open https://{}:{} in Yasd", config.host, config.port);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
