//! Startup configuration
//! Reads the certificate authority out of a Surge profile and validates the
//! options the helper starts with

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Profile section Surge keeps its MITM certificate in
const MITM_SECTION: &str = "MITM";
const CA_P12_KEY: &str = "ca-p12";
const CA_PASSPHRASE_KEY: &str = "ca-passphrase";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_POOL_MAX_IDLE: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("profile {} does not exist", .0.display())]
    ProfileNotFound(PathBuf),

    #[error("failed to read profile {}: {source}", .path.display())]
    ProfileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate source given, pass a Surge profile or the CA archive and passphrase")]
    NoSource,

    #[error("profile has no MITM certificate ({missing} is missing), generate one in Surge and retry")]
    MissingMitm { missing: &'static str },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// CA material as found in a profile or given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MitmSettings {
    pub ca_p12: Option<String>,
    pub ca_passphrase: Option<String>,
}

impl MitmSettings {
    /// Values in `overrides` win over the ones in `self`
    fn merged_with(self, overrides: MitmSettings) -> MitmSettings {
        MitmSettings {
            ca_p12: overrides.ca_p12.or(self.ca_p12),
            ca_passphrase: overrides.ca_passphrase.or(self.ca_passphrase),
        }
    }

    fn is_empty(&self) -> bool {
        self.ca_p12.is_none() && self.ca_passphrase.is_none()
    }
}

/// Read the `[MITM]` section of a Surge profile
pub fn load_surge_profile<P: AsRef<Path>>(path: P) -> Result<MitmSettings, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::ProfileNotFound(path.to_path_buf()));
    }

    let text = fs::read_to_string(path).map_err(|source| ConfigError::ProfileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Read profile {}", path.display());
    Ok(parse_mitm_section(&text))
}

/// Pull the MITM keys out of INI text. Unknown sections and keys are ignored.
pub fn parse_mitm_section(text: &str) -> MitmSettings {
    let mut settings = MitmSettings::default();
    let mut in_mitm = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_mitm = section.trim() == MITM_SECTION;
            continue;
        }

        if !in_mitm {
            continue;
        }

        // Base64 values end in '=' padding, so only the first '=' separates
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim()).to_string();

        match key.trim() {
            CA_P12_KEY => settings.ca_p12 = Some(value),
            CA_PASSPHRASE_KEY => settings.ca_passphrase = Some(value),
            _ => {}
        }
    }

    settings
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Everything the helper needs before it can start listening
#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub surge_profile: Option<PathBuf>,
    pub ca_p12: Option<String>,
    pub ca_passphrase: Option<String>,
    pub host: String,
    pub port: u16,
    pub upstream_timeout_secs: u64,
    pub pool_max_idle: usize,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            surge_profile: None,
            ca_p12: None,
            ca_passphrase: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            pool_max_idle: DEFAULT_POOL_MAX_IDLE,
        }
    }
}

/// Validated startup configuration
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub ca_p12: String,
    pub ca_passphrase: String,
    pub host: String,
    pub port: u16,
    pub upstream_timeout: Duration,
    pub pool_max_idle: usize,
}

impl HelperConfig {
    pub fn from_options(options: StartupOptions) -> Result<Self, ConfigError> {
        let profile = match &options.surge_profile {
            Some(path) => load_surge_profile(path)?,
            None => MitmSettings::default(),
        };
        let direct = MitmSettings {
            ca_p12: options.ca_p12,
            ca_passphrase: options.ca_passphrase,
        };

        if options.surge_profile.is_none() && direct.is_empty() {
            return Err(ConfigError::NoSource);
        }

        let mitm = profile.merged_with(direct);
        let ca_p12 = mitm
            .ca_p12
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingMitm { missing: CA_P12_KEY })?;
        let ca_passphrase = mitm.ca_passphrase.ok_or(ConfigError::MissingMitm {
            missing: CA_PASSPHRASE_KEY,
        })?;

        let host = options.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if options.port == 0 {
            return Err(ConfigError::Invalid("port must not be 0".to_string()));
        }
        if options.upstream_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "upstream timeout must be at least one second".to_string(),
            ));
        }

        Ok(Self {
            ca_p12,
            ca_passphrase,
            host,
            port: options.port,
            upstream_timeout: Duration::from_secs(options.upstream_timeout_secs),
            pool_max_idle: options.pool_max_idle,
        })
    }
}
